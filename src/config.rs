//! Configuration types.

use std::num::NonZero;
use std::time::Duration;

use crate::error::ConfigError;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of tasks running at once.
    pub batch_size: usize,
    /// Minimum time between forwarded value updates for one task.
    pub max_update_frequency: Duration,
    /// Minimum value delta before a value update is forwarded.
    /// `None` derives it from each task's total (total / 250).
    pub min_update_increment: Option<f64>,
    /// Exit the control loop as soon as every task is terminal.
    pub quit_on_finished: bool,
    /// Emit focus hints for the display as tasks complete.
    pub autoscroll: bool,
    /// Control loop tick.
    pub poll_interval: Duration,
    /// How often a paused task checks for the resume message.
    pub pause_poll_interval: Duration,
    /// How long teardown waits for cancelled workers to reach a checkpoint.
    pub teardown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_update_frequency: Duration::from_millis(20),
            min_update_increment: None,
            quit_on_finished: true,
            autoscroll: true,
            poll_interval: Duration::from_millis(10),
            pause_poll_interval: Duration::from_millis(100),
            teardown_grace: Duration::from_millis(500),
        }
    }
}

impl OrchestratorConfig {
    /// Build a configuration from `PROGRESS_POOL_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let batch_size = env_parse("PROGRESS_POOL_BATCH_SIZE").unwrap_or(defaults.batch_size);
        let max_update_frequency = env_parse("PROGRESS_POOL_MAX_UPDATE_FREQUENCY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_update_frequency);
        let min_update_increment = env_parse("PROGRESS_POOL_MIN_UPDATE_INCREMENT");
        let quit_on_finished =
            env_parse("PROGRESS_POOL_QUIT_ON_FINISHED").unwrap_or(defaults.quit_on_finished);
        let autoscroll = env_parse("PROGRESS_POOL_AUTOSCROLL").unwrap_or(defaults.autoscroll);
        let poll_interval = env_parse("PROGRESS_POOL_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let pause_poll_interval = env_parse("PROGRESS_POOL_PAUSE_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.pause_poll_interval);
        let teardown_grace = env_parse("PROGRESS_POOL_TEARDOWN_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.teardown_grace);

        Self {
            batch_size,
            max_update_frequency,
            min_update_increment,
            quit_on_finished,
            autoscroll,
            poll_interval,
            pause_poll_interval,
            teardown_grace,
        }
    }

    /// Set the admission window.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Disable update gating entirely (every value is forwarded).
    pub fn without_throttle(mut self) -> Self {
        self.max_update_frequency = Duration::ZERO;
        self.min_update_increment = Some(0.0);
        self
    }

    /// Check the configuration for values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.pause_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "pause_poll_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        match self.min_update_increment {
            Some(increment) if !(increment.is_finite() && increment >= 0.0) => {
                Err(ConfigError::InvalidValue {
                    key: "min_update_increment".to_string(),
                    message: format!("must be a non-negative number, got {increment}"),
                })
            }
            _ => Ok(()),
        }
    }
}

fn default_batch_size() -> usize {
    std::thread::available_parallelism()
        .map(NonZero::get)
        .unwrap_or(1)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
