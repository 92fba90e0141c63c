//! In-task progress emitter.
//!
//! A [`Progress`] is handed to every task body. It sends name/total/value
//! updates to the control loop and, at each checkpoint, honors pause and
//! interrupt requests coming back the other way. Telemetry is best-effort:
//! once the control side is gone every call becomes a no-op.

use std::cell::Cell;
use std::iter::FusedIterator;
use std::time::Duration;

use crate::error::{ChannelError, Interrupted};
use crate::worker::channel::{ControlMessage, TaskEnd, TaskMessage};
use crate::worker::task::ProgressMode;

/// Progress emitter living on the task's worker thread.
#[derive(Debug)]
pub struct Progress {
    end: TaskEnd,
    mode: ProgressMode,
    pause_poll_interval: Duration,
    paused: Cell<bool>,
    closed: Cell<bool>,
    interrupted: Cell<bool>,
    warned_mode: Cell<bool>,
}

impl Progress {
    pub(crate) fn new(end: TaskEnd, mode: ProgressMode, pause_poll_interval: Duration) -> Self {
        Self {
            end,
            mode,
            pause_poll_interval,
            paused: Cell::new(false),
            closed: Cell::new(false),
            interrupted: Cell::new(false),
            warned_mode: Cell::new(false),
        }
    }

    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    /// Whether an interrupt has been received. Sticky: once set, every
    /// later checkpoint fails and the task ends as cancelled whatever the
    /// body returns.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.get()
    }

    /// Send a new description.
    pub fn set_description(&self, text: impl Into<String>) {
        self.send(TaskMessage::Name(text.into()));
    }

    /// Send a new expected total.
    pub fn set_total(&self, total: f64) {
        self.send(TaskMessage::Total(total));
    }

    /// Report an absolute value and wait for the control side to answer.
    ///
    /// Only meaningful for tasks registered in [`ProgressMode::Manual`];
    /// automatic tasks report through [`Progress::iterate`] and this call is
    /// ignored for them.
    pub fn set_value(&self, value: f64) -> Result<(), Interrupted> {
        if self.mode != ProgressMode::Manual {
            if !self.warned_mode.replace(true) {
                tracing::warn!("set_value ignored: task reports progress by iteration");
            }
            return Ok(());
        }

        self.send(TaskMessage::Value { value, reply: true });
        self.await_reply()?;
        self.checkpoint()
    }

    /// Wrap an iterator so every step reports progress and checks for
    /// control requests.
    pub fn iterate<I: IntoIterator>(&self, iter: I) -> Tracked<'_, I::IntoIter> {
        Tracked {
            progress: self,
            inner: iter.into_iter(),
            count: 0,
            done: false,
        }
    }

    /// Like [`Progress::iterate`], sending a description and total first.
    pub fn iterate_with<I: IntoIterator>(
        &self,
        iter: I,
        description: impl Into<String>,
        total: f64,
    ) -> Tracked<'_, I::IntoIter> {
        self.set_description(description);
        self.set_total(total);
        self.iterate(iter)
    }

    fn send(&self, msg: TaskMessage) {
        if self.closed.get() {
            return;
        }
        if let Err(ChannelError::Closed) = self.end.send(msg) {
            tracing::debug!("Progress channel closed, dropping further updates");
            self.closed.set(true);
        }
    }

    /// Report a value from iteration (no reply awaited) and run a checkpoint.
    fn report(&self, value: f64) -> Result<(), Interrupted> {
        if self.mode == ProgressMode::Manual {
            return Ok(());
        }
        self.send(TaskMessage::Value {
            value,
            reply: false,
        });
        self.checkpoint()
    }

    /// Final value once iteration ends. No checkpoint: the loop is over.
    fn report_final(&self, value: f64) {
        if self.mode == ProgressMode::Manual {
            return;
        }
        self.send(TaskMessage::Value {
            value,
            reply: false,
        });
    }

    /// Apply every queued control message, then block while paused.
    fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.interrupted.get() {
            return Err(Interrupted);
        }
        // Messages queued before the control side went away still count.
        loop {
            match self.end.try_recv() {
                Ok(Some(msg)) => self.apply(msg)?,
                Ok(None) => break,
                Err(_) => {
                    self.closed.set(true);
                    break;
                }
            }
        }
        if self.paused.get() {
            self.wait_for_resume()?;
        }
        Ok(())
    }

    fn apply(&self, msg: ControlMessage) -> Result<(), Interrupted> {
        match msg {
            ControlMessage::Interrupt(true) => {
                tracing::debug!("Interrupt received at checkpoint");
                self.interrupted.set(true);
                Err(Interrupted)
            }
            ControlMessage::Interrupt(false) | ControlMessage::Ack => Ok(()),
            ControlMessage::Pause(paused) => {
                self.paused.set(paused);
                Ok(())
            }
        }
    }

    fn wait_for_resume(&self) -> Result<(), Interrupted> {
        tracing::debug!("Task paused");
        while self.paused.get() {
            match self.end.recv_timeout(self.pause_poll_interval) {
                Ok(Some(msg)) => self.apply(msg)?,
                Ok(None) => {}
                Err(_) => {
                    // Nobody left to resume us.
                    self.closed.set(true);
                    self.paused.set(false);
                }
            }
        }
        tracing::debug!("Task resumed");
        Ok(())
    }

    /// Block until the control side sends anything back.
    fn await_reply(&self) -> Result<(), Interrupted> {
        loop {
            match self.end.recv_timeout(self.pause_poll_interval) {
                Ok(Some(msg)) => return self.apply(msg),
                Ok(None) => {}
                Err(_) => {
                    self.closed.set(true);
                    return Ok(());
                }
            }
        }
    }
}

/// Iterator returned by [`Progress::iterate`].
///
/// Yields `Err(Interrupted)` once if the task is cancelled at a checkpoint,
/// then ends. For `n` elements it reports `n + 1` values: one after each
/// element once the caller comes back for the next, and a final one when
/// the input is exhausted.
#[derive(Debug)]
pub struct Tracked<'a, I> {
    progress: &'a Progress,
    inner: I,
    count: u64,
    done: bool,
}

impl<I> Tracked<'_, I> {
    /// Elements produced so far.
    pub fn produced(&self) -> u64 {
        self.count
    }
}

impl<I: Iterator> Iterator for Tracked<'_, I> {
    type Item = Result<I::Item, Interrupted>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.count > 0 {
            if let Err(interrupted) = self.progress.report(self.count as f64) {
                self.done = true;
                return Some(Err(interrupted));
            }
        }

        match self.inner.next() {
            Some(item) => {
                self.count += 1;
                Some(Ok(item))
            }
            None => {
                self.done = true;
                self.progress.report_final(self.count as f64);
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            let (_, upper) = self.inner.size_hint();
            (0, upper.and_then(|n| n.checked_add(1)))
        }
    }
}

impl<I: Iterator> FusedIterator for Tracked<'_, I> {}
