//! Duplex progress channel between a task and the control loop.
//!
//! Task → control runs over an unbounded tokio queue drained by the control
//! loop without blocking. Control → task runs over a std queue so the worker
//! thread can wait on it with a timeout.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Messages sent from a running task to the control side.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMessage {
    /// Description changed.
    Name(String),
    /// Expected total changed.
    Total(f64),
    /// Progress advanced to this absolute value.
    /// `reply` is set when the task blocks until the control side answers.
    Value { value: f64, reply: bool },
}

/// Messages sent from the control side to a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// `true` asks the task to stop at its next checkpoint.
    Interrupt(bool),
    /// `true` pauses the task at its next checkpoint, `false` resumes it.
    Pause(bool),
    /// Answer to a reply-awaiting value when nothing else is pending.
    Ack,
}

/// Create a connected pair of channel ends.
pub fn duplex() -> (ControlEnd, TaskEnd) {
    let (task_tx, task_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = std_mpsc::channel();
    (
        ControlEnd {
            tx: control_tx,
            rx: task_rx,
        },
        TaskEnd {
            tx: task_tx,
            rx: control_rx,
        },
    )
}

/// The end held by the task handle in the control loop.
#[derive(Debug)]
pub struct ControlEnd {
    tx: std_mpsc::Sender<ControlMessage>,
    rx: mpsc::UnboundedReceiver<TaskMessage>,
}

impl ControlEnd {
    pub fn send(&self, msg: ControlMessage) -> Result<(), ChannelError> {
        self.tx.send(msg).map_err(|_| ChannelError::Closed)
    }

    /// Take the next queued message without waiting.
    ///
    /// Messages still queued after the task end is dropped are delivered
    /// before `Closed` is reported.
    pub fn try_recv(&mut self) -> Result<Option<TaskMessage>, ChannelError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }
}

/// The end moved into the task's worker thread.
#[derive(Debug)]
pub struct TaskEnd {
    tx: mpsc::UnboundedSender<TaskMessage>,
    rx: std_mpsc::Receiver<ControlMessage>,
}

impl TaskEnd {
    pub fn send(&self, msg: TaskMessage) -> Result<(), ChannelError> {
        self.tx.send(msg).map_err(|_| ChannelError::Closed)
    }

    pub fn try_recv(&self) -> Result<Option<ControlMessage>, ChannelError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(std_mpsc::TryRecvError::Empty) => Ok(None),
            Err(std_mpsc::TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ControlMessage>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }
}
