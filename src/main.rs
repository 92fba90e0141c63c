use std::time::Instant;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast::error::RecvError;

use progress_pool::worker::TaskArgs;
use progress_pool::{Orchestrator, OrchestratorConfig, Progress, ProgressEvent};

/// Tasks queued by the demo.
const NUM_TASKS: usize = 25;
/// Bounds for the outer loop (the reported total).
const OUTER: (u64, u64) = (10, 50);
/// Bounds for the busy work between checkpoints.
const INNER: (u64, u64) = (500_000, 1_000_000);

/// Burn some CPU per iteration, reporting progress through `progress`.
fn slow_loop(args: TaskArgs, progress: &Progress) -> anyhow::Result<(String, u64)> {
    let name: String = args.arg(0)?;
    let count: u64 = args.arg(1)?;
    let count_inner: u64 = args.kwarg("count_inner")?;

    for i in progress.iterate_with(0..count, name.clone(), count as f64) {
        let i = i?;
        let mut acc = 0u64;
        for j in 0..count_inner {
            acc = std::hint::black_box(acc.wrapping_add(j + i));
        }
    }
    Ok((name, count))
}

fn random_name(rng: &mut impl Rng) -> String {
    let len = rng.gen_range(8..32);
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing, to a daily log file when a directory is given
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("PROGRESS_POOL_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "progress-pool.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = OrchestratorConfig::from_env();
    eprintln!("📊 Progress Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tasks: {}", NUM_TASKS);
    eprintln!("   Batch size: {}\n", config.batch_size);

    let mut orchestrator = Orchestrator::new(config)?;

    let mut rng = rand::thread_rng();
    for _ in 0..NUM_TASKS {
        let name = random_name(&mut rng);
        let outer = rng.gen_range(OUTER.0..OUTER.1);
        let inner = rng.gen_range(INNER.0..INNER.1);

        let mut kwargs = Map::new();
        kwargs.insert("count_inner".to_string(), json!(inner));
        orchestrator
            .add_task(
                slow_loop,
                vec![json!(name), json!(outer)],
                kwargs,
                name.clone(),
                outer as f64,
            )
            .await?;
    }

    // ── Observer ────────────────────────────────────────────────────────
    let mut events = orchestrator.subscribe();
    let observer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProgressEvent::Value { .. }) => {}
                Ok(ProgressEvent::AllFinished) => {
                    tracing::info!("Observer saw all tasks finish");
                    break;
                }
                Ok(event) => {
                    tracing::debug!(event = event.event_type(), task_id = ?event.task_id(), "Progress event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Observer lagging behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let started = Instant::now();
    let results = orchestrator.get().await?;
    if let Err(e) = observer.await {
        tracing::error!(error = %e, "Observer task failed");
    }

    tracing::info!(
        results = results.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Run complete"
    );

    let ordered: Vec<Value> = results
        .into_iter()
        .map(|(task_id, (name, count))| json!({ "task_id": task_id, "name": name, "count": count }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&ordered)?);

    Ok(())
}
