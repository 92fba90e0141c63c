//! Task handle — the control-loop side of one running task.

use std::any::Any;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::Interrupted;
use crate::worker::board::ProgressBoard;
use crate::worker::channel::{ControlEnd, ControlMessage, TaskMessage, duplex};
use crate::worker::progress::Progress;
use crate::worker::task::{TaskId, TaskOutcome, TaskSpec};

/// Bridges one task running on a worker thread to the control loop.
///
/// The handle never touches task state directly: pause and cancel requests
/// are only ever delivered as channel messages, picked up by the task at
/// its next checkpoint.
pub struct TaskHandle<T> {
    task_id: TaskId,
    control: ControlEnd,
    join: JoinHandle<anyhow::Result<T>>,
    cancel_requested: bool,
    interrupt_sent: bool,
    pause_request: Option<bool>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Create the task's channel and launch its body on a blocking worker thread.
    pub fn start(task_id: TaskId, spec: TaskSpec<T>, pause_poll_interval: Duration) -> Self {
        let (control, task_end) = duplex();
        let TaskSpec {
            func, args, mode, ..
        } = spec;

        let join = tokio::task::spawn_blocking(move || {
            let progress = Progress::new(task_end, mode, pause_poll_interval);
            let result = func(args, &progress);
            if progress.is_interrupted() {
                // Cancelled even if the body swallowed the interrupt.
                return Err(anyhow::Error::new(Interrupted));
            }
            result
        });

        tracing::debug!(task_id = %task_id, mode = ?mode, "Task started on worker thread");

        Self {
            task_id,
            control,
            join,
            cancel_requested: false,
            interrupt_sent: false,
            pause_request: None,
        }
    }
}

impl<T> TaskHandle<T> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Ask the task to stop at its next checkpoint.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Ask the task to pause (`true`) or resume (`false`).
    pub fn request_pause(&mut self, paused: bool) {
        self.pause_request = Some(paused);
    }

    /// Send the interrupt right away, outside a control-loop tick.
    pub fn interrupt_now(&mut self) {
        self.cancel_requested = true;
        if !self.interrupt_sent {
            self.send_interrupt();
        }
    }

    /// Whether the task body has returned (or panicked).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// One control-loop tick: relay every queued task message to the board,
    /// then deliver outstanding control requests.
    pub async fn service(&mut self, board: &ProgressBoard) {
        self.drain(board).await;

        if self.cancel_requested && !self.interrupt_sent {
            self.send_interrupt();
        }
        if let Some(paused) = self.pause_request.take() {
            self.deliver(ControlMessage::Pause(paused));
        }
    }

    /// Collect the outcome of a finished task.
    ///
    /// Waits for the worker thread, then relays any messages it left queued.
    pub async fn finish(mut self, board: &ProgressBoard) -> TaskOutcome<T> {
        let joined = (&mut self.join).await;
        self.drain(board).await;

        match joined {
            Ok(Ok(value)) => TaskOutcome::Succeeded(value),
            Ok(Err(err)) if err.downcast_ref::<Interrupted>().is_some() => TaskOutcome::Cancelled,
            Ok(Err(err)) => TaskOutcome::Failed(format!("{err:#}")),
            Err(join_err) if join_err.is_panic() => {
                TaskOutcome::Failed(panic_message(join_err.into_panic()))
            }
            Err(join_err) => TaskOutcome::Failed(join_err.to_string()),
        }
    }

    async fn drain(&mut self, board: &ProgressBoard) {
        // Closed just means the task end is gone and the queue is empty.
        while let Ok(Some(msg)) = self.control.try_recv() {
            self.relay(msg, board).await;
        }
    }

    async fn relay(&mut self, msg: TaskMessage, board: &ProgressBoard) {
        match msg {
            TaskMessage::Name(name) => board.update_name(self.task_id, name).await,
            TaskMessage::Total(total) => board.update_total(self.task_id, total).await,
            TaskMessage::Value { value, reply } => {
                board.update_value(self.task_id, value, false).await;
                if reply {
                    self.answer();
                }
            }
        }
    }

    /// Reply to a manual value: the pending control request if there is one.
    fn answer(&mut self) {
        if self.cancel_requested && !self.interrupt_sent {
            self.send_interrupt();
        } else if let Some(paused) = self.pause_request.take() {
            self.deliver(ControlMessage::Pause(paused));
        } else {
            self.deliver(ControlMessage::Ack);
        }
    }

    fn send_interrupt(&mut self) {
        self.deliver(ControlMessage::Interrupt(true));
        self.interrupt_sent = true;
    }

    fn deliver(&self, msg: ControlMessage) {
        if self.control.send(msg).is_err() {
            tracing::debug!(task_id = %self.task_id, message = ?msg, "Task already gone, dropping control message");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::worker::state::TaskRecord;
    use crate::worker::task::ProgressMode;
    use crate::worker::throttle::Throttle;

    const TICK: Duration = Duration::from_millis(5);

    async fn board_for(id: TaskId, mode: ProgressMode) -> ProgressBoard {
        let board = ProgressBoard::new(Throttle::new(Duration::ZERO, Some(0.0)));
        board.register(TaskRecord::new(id, "", 10.0, mode)).await;
        board
    }

    async fn run_to_end<T: Send + 'static>(
        mut handle: TaskHandle<T>,
        board: &ProgressBoard,
    ) -> TaskOutcome<T> {
        while !handle.is_finished() {
            handle.service(board).await;
            tokio::time::sleep(TICK).await;
        }
        handle.finish(board).await
    }

    #[tokio::test]
    async fn successful_task_relays_progress() {
        let id = TaskId(0);
        let board = board_for(id, ProgressMode::Automatic).await;
        let spec = TaskSpec::new(|_, progress: &Progress| {
            progress.set_description("counting");
            let mut sum = 0;
            for item in progress.iterate(1..=4) {
                sum += item?;
            }
            Ok(sum)
        });

        let handle = TaskHandle::start(id, spec, TICK);
        match run_to_end(handle, &board).await {
            TaskOutcome::Succeeded(sum) => assert_eq!(sum, 10),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let record = board.get(id).await.unwrap();
        assert_eq!(record.description, "counting");
        assert_eq!(record.value, 4.0);
    }

    #[tokio::test]
    async fn error_becomes_failed_with_chain() {
        let id = TaskId(1);
        let board = board_for(id, ProgressMode::Automatic).await;
        let spec: TaskSpec<()> = TaskSpec::new(|_, _| {
            Err(anyhow::anyhow!("disk full")).map_err(|e| e.context("writing shard"))
        });

        match run_to_end(TaskHandle::start(id, spec, TICK), &board).await {
            TaskOutcome::Failed(msg) => assert_eq!(msg, "writing shard: disk full"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_becomes_failed() {
        let id = TaskId(2);
        let board = board_for(id, ProgressMode::Automatic).await;
        let spec: TaskSpec<()> = TaskSpec::new(|_, _| panic!("kaboom"));

        match run_to_end(TaskHandle::start(id, spec, TICK), &board).await {
            TaskOutcome::Failed(msg) => assert_eq!(msg, "task panicked: kaboom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_request_interrupts_at_checkpoint() {
        let id = TaskId(3);
        let board = board_for(id, ProgressMode::Automatic).await;
        let reached_end = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached_end);
        let spec = TaskSpec::new(move |_, progress: &Progress| {
            for item in progress.iterate(0..10_000) {
                item?;
                std::thread::sleep(Duration::from_millis(1));
            }
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let mut handle = TaskHandle::start(id, spec, TICK);
        handle.request_cancel();
        assert!(handle.cancel_requested());

        assert!(matches!(run_to_end(handle, &board).await, TaskOutcome::Cancelled));
        assert!(!reached_end.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn swallowed_interrupt_still_cancels() {
        let id = TaskId(6);
        let board = board_for(id, ProgressMode::Automatic).await;
        let spec = TaskSpec::new(|_, progress: &Progress| {
            let mut done = 0u64;
            for item in progress.iterate(0..10_000) {
                if item.is_ok() {
                    done += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(done)
        });

        let mut handle = TaskHandle::start(id, spec, TICK);
        handle.request_cancel();
        assert!(matches!(run_to_end(handle, &board).await, TaskOutcome::Cancelled));
    }

    #[tokio::test]
    async fn manual_values_are_answered() {
        let id = TaskId(4);
        let board = board_for(id, ProgressMode::Manual).await;
        let spec = TaskSpec::new(|_, progress: &Progress| {
            for step in 1..=3 {
                progress.set_value(step as f64 * 2.0)?;
            }
            Ok("done")
        })
        .manual();

        match run_to_end(TaskHandle::start(id, spec, TICK), &board).await {
            TaskOutcome::Succeeded(out) => assert_eq!(out, "done"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(board.get(id).await.unwrap().value, 6.0);
    }

    #[tokio::test]
    async fn manual_value_reply_carries_cancel() {
        let id = TaskId(5);
        let board = board_for(id, ProgressMode::Manual).await;
        let spec: TaskSpec<()> = TaskSpec::new(|_, progress: &Progress| {
            loop {
                progress.set_value(1.0)?;
            }
        })
        .manual();

        let mut handle = TaskHandle::start(id, spec, TICK);
        handle.request_cancel();
        assert!(matches!(run_to_end(handle, &board).await, TaskOutcome::Cancelled));
    }

    #[test]
    fn panic_payloads() {
        assert_eq!(panic_message(Box::new("static")), "task panicked: static");
        assert_eq!(
            panic_message(Box::new(String::from("owned"))),
            "task panicked: owned"
        );
        assert_eq!(panic_message(Box::new(42u8)), "task panicked");
    }
}
