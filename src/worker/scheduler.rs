//! Orchestrator — admission control and the single control loop.
//!
//! The orchestrator owns the pending queue, the running handles and the
//! result table. Only the control loop in [`Orchestrator::begin_processing`]
//! touches them; everything else (displays, key bindings, other tasks)
//! talks to it through an [`OrchestratorController`], which sends
//! [`ControlRequest`]s, or through the shared [`ProgressBoard`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use crate::config::OrchestratorConfig;
use crate::error::{Error, OrchestratorError};
use crate::worker::board::ProgressBoard;
use crate::worker::events::ProgressEvent;
use crate::worker::handle::TaskHandle;
use crate::worker::progress::Progress;
use crate::worker::state::{TaskRecord, TaskState};
use crate::worker::task::{TaskArgs, TaskId, TaskOutcome, TaskSpec};
use crate::worker::throttle::Throttle;

/// Requests accepted by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Cancel a task. Running tasks stop at their next checkpoint; pending
    /// tasks are dropped from the queue.
    Cancel(TaskId),
    /// Pause or resume one running task.
    SetPaused(TaskId, bool),
    /// Flip the global pause flag for every running task.
    TogglePauseAll,
    SetAutoscroll(bool),
    ToggleAutoscroll,
    /// Stop processing: cancel whatever is still running and return.
    Quit,
}

/// Cloneable handle for steering a running orchestrator from outside the
/// control loop.
#[derive(Clone)]
pub struct OrchestratorController {
    tx: mpsc::UnboundedSender<ControlRequest>,
    board: Arc<ProgressBoard>,
}

impl OrchestratorController {
    fn send(&self, request: ControlRequest) -> Result<(), OrchestratorError> {
        self.tx
            .send(request)
            .map_err(|_| OrchestratorError::ControlLoopClosed)
    }

    pub fn request_cancel(&self, task_id: TaskId) -> Result<(), OrchestratorError> {
        self.send(ControlRequest::Cancel(task_id))
    }

    pub fn set_paused(&self, task_id: TaskId, paused: bool) -> Result<(), OrchestratorError> {
        self.send(ControlRequest::SetPaused(task_id, paused))
    }

    pub fn toggle_pause_all(&self) -> Result<(), OrchestratorError> {
        self.send(ControlRequest::TogglePauseAll)
    }

    pub fn set_autoscroll(&self, enabled: bool) -> Result<(), OrchestratorError> {
        self.send(ControlRequest::SetAutoscroll(enabled))
    }

    pub fn toggle_autoscroll(&self) -> Result<(), OrchestratorError> {
        self.send(ControlRequest::ToggleAutoscroll)
    }

    pub fn quit(&self) -> Result<(), OrchestratorError> {
        self.send(ControlRequest::Quit)
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.board.subscribe()
    }

    /// Live task records.
    pub fn board(&self) -> &Arc<ProgressBoard> {
        &self.board
    }
}

/// Runs queued tasks with at most `batch_size` executing at once.
pub struct Orchestrator<T> {
    config: OrchestratorConfig,
    board: Arc<ProgressBoard>,
    next_id: u64,
    pending: VecDeque<(TaskId, TaskSpec<T>)>,
    running: BTreeMap<TaskId, TaskHandle<T>>,
    results: BTreeMap<TaskId, T>,
    /// Dropped once processing starts, so the loop can tell when every
    /// controller is gone.
    commands_tx: Option<mpsc::UnboundedSender<ControlRequest>>,
    commands_rx: mpsc::UnboundedReceiver<ControlRequest>,
    all_paused: bool,
    autoscroll: bool,
    processed: bool,
    finished: bool,
    quit_requested: bool,
    peak_running: usize,
}

impl<T: Send + 'static> Orchestrator<T> {
    /// Create an orchestrator. Fails on an unusable configuration.
    pub fn new(config: OrchestratorConfig) -> Result<Self, Error> {
        config.validate()?;

        let board = Arc::new(ProgressBoard::new(Throttle::from(&config)));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let autoscroll = config.autoscroll;

        Ok(Self {
            config,
            board,
            next_id: 0,
            pending: VecDeque::new(),
            running: BTreeMap::new(),
            results: BTreeMap::new(),
            commands_tx: Some(commands_tx),
            commands_rx,
            all_paused: false,
            autoscroll,
            processed: false,
            finished: false,
            quit_requested: false,
            peak_running: 0,
        })
    }

    /// Queue a task from its parts.
    pub async fn add_task<F>(
        &mut self,
        func: F,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        description: impl Into<String>,
        total: f64,
    ) -> Result<TaskId, OrchestratorError>
    where
        F: FnOnce(TaskArgs, &Progress) -> anyhow::Result<T> + Send + 'static,
    {
        let spec = TaskSpec::new(func)
            .args(args)
            .kwargs(kwargs)
            .description(description)
            .total(total);
        self.submit(spec).await
    }

    /// Queue a task. IDs are handed out in submission order, starting at 0.
    pub async fn submit(&mut self, spec: TaskSpec<T>) -> Result<TaskId, OrchestratorError> {
        if self.processed {
            return Err(OrchestratorError::AlreadyProcessed);
        }

        let task_id = TaskId(self.next_id);
        self.next_id += 1;

        self.board
            .register(TaskRecord::new(
                task_id,
                spec.description.clone(),
                spec.total,
                spec.mode,
            ))
            .await;
        self.pending.push_back((task_id, spec));

        tracing::debug!(task_id = %task_id, "Task queued");
        Ok(task_id)
    }

    /// Handle for steering the run from elsewhere. Take it before calling
    /// [`Orchestrator::begin_processing`].
    pub fn controller(&self) -> OrchestratorController {
        let tx = match &self.commands_tx {
            Some(tx) => tx.clone(),
            // Processing already started: hand out a controller whose
            // requests fail with `ControlLoopClosed`.
            None => mpsc::unbounded_channel().0,
        };
        OrchestratorController {
            tx,
            board: Arc::clone(&self.board),
        }
    }

    pub fn board(&self) -> &Arc<ProgressBoard> {
        &self.board
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.board.subscribe()
    }

    /// Run every queued task to a terminal state.
    ///
    /// Returns once nothing is pending or running (or, with
    /// `quit_on_finished` off, once a quit request arrives or every
    /// controller is dropped). Per-task failures never make this fail.
    pub async fn begin_processing(&mut self) -> Result<(), Error> {
        if self.processed {
            return Err(OrchestratorError::AlreadyProcessed.into());
        }
        self.processed = true;
        self.commands_tx = None;

        tracing::info!(
            tasks = self.pending.len(),
            batch_size = self.config.batch_size,
            "Processing started"
        );

        self.admit().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            self.handle_requests().await;
            if self.quit_requested {
                tracing::info!("Quit requested, stopping remaining tasks");
                self.shutdown().await;
                break;
            }

            self.service_running().await;
            self.reap_finished().await;

            if self.pending.is_empty() && self.running.is_empty() {
                self.declare_finished();
                if !self.config.quit_on_finished {
                    self.serve_until_quit().await;
                }
                break;
            }
        }

        Ok(())
    }

    /// Process everything, then hand back the results.
    pub async fn get(mut self) -> Result<BTreeMap<TaskId, T>, Error> {
        self.begin_processing().await?;
        Ok(self.into_results())
    }

    /// Results of tasks that succeeded, ordered by task ID.
    pub fn get_results(&self) -> &BTreeMap<TaskId, T> {
        &self.results
    }

    pub fn into_results(mut self) -> BTreeMap<TaskId, T> {
        std::mem::take(&mut self.results)
    }

    /// Current state of a task.
    pub async fn status(&self, task_id: TaskId) -> Result<TaskState, OrchestratorError> {
        Ok(self.board.get(task_id).await?.state)
    }

    /// State of every task, ordered by task ID.
    pub async fn statuses(&self) -> BTreeMap<TaskId, TaskState> {
        self.board
            .snapshot()
            .await
            .into_iter()
            .map(|record| (record.task_id, record.state))
            .collect()
    }

    /// Full record of a task, including failure detail.
    pub async fn record(&self, task_id: TaskId) -> Result<TaskRecord, OrchestratorError> {
        self.board.get(task_id).await
    }

    pub async fn update_name(&self, task_id: TaskId, name: impl Into<String>) {
        self.board.update_name(task_id, name).await;
    }

    pub async fn update_total(&self, task_id: TaskId, total: f64) {
        self.board.update_total(task_id, total).await;
    }

    pub async fn update_value(&self, task_id: TaskId, value: f64, force: bool) -> bool {
        self.board.update_value(task_id, value, force).await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Highest number of tasks that were running at the same time.
    pub fn peak_running(&self) -> usize {
        self.peak_running
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn all_paused(&self) -> bool {
        self.all_paused
    }

    pub fn autoscroll(&self) -> bool {
        self.autoscroll
    }

    /// Cancel everything still queued or running.
    ///
    /// Running tasks get `teardown_grace` to reach a checkpoint; any that do
    /// not are abandoned and marked cancelled. Cancellation is cooperative:
    /// an abandoned task's blocking thread keeps running until its body
    /// returns, and dropping the tokio runtime waits for it, so a body that
    /// never reaches a checkpoint can hold up process exit.
    pub async fn shutdown(&mut self) {
        while let Some((task_id, _spec)) = self.pending.pop_front() {
            self.mark(task_id, TaskState::Cancelled, "orchestrator shut down", None)
                .await;
        }

        for handle in self.running.values_mut() {
            handle.request_cancel();
        }

        let deadline = Instant::now() + self.config.teardown_grace;
        while !self.running.is_empty() && Instant::now() < deadline {
            self.service_running().await;
            self.reap_finished().await;
            if !self.running.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        for (task_id, mut handle) in std::mem::take(&mut self.running) {
            // The worker keeps running until it reaches a checkpoint.
            handle.service(&self.board).await;
            tracing::warn!(task_id = %task_id, "Task did not stop in time, abandoning it");
            self.mark(task_id, TaskState::Cancelled, "abandoned at teardown", None)
                .await;
        }
    }

    /// Fill free slots from the pending queue.
    async fn admit(&mut self) {
        while self.running.len() < self.config.batch_size {
            let Some((task_id, spec)) = self.pending.pop_front() else {
                break;
            };

            if let Err(e) = self
                .board
                .transition(task_id, TaskState::Running, None, None)
                .await
            {
                tracing::error!(task_id = %task_id, error = %e, "Could not start task");
                continue;
            }

            let mut handle = TaskHandle::start(task_id, spec, self.config.pause_poll_interval);
            if self.all_paused {
                handle.request_pause(true);
                self.set_paused_flag(task_id, true).await;
            }
            self.running.insert(task_id, handle);
            self.peak_running = self.peak_running.max(self.running.len());

            tracing::info!(
                task_id = %task_id,
                running = self.running.len(),
                pending = self.pending.len(),
                "Task admitted"
            );
        }
    }

    async fn handle_requests(&mut self) {
        while let Ok(request) = self.commands_rx.try_recv() {
            self.apply(request).await;
        }
    }

    async fn serve_until_quit(&mut self) {
        while let Some(request) = self.commands_rx.recv().await {
            self.apply(request).await;
            if self.quit_requested {
                break;
            }
        }
    }

    async fn apply(&mut self, request: ControlRequest) {
        tracing::debug!(request = ?request, "Control request");
        match request {
            ControlRequest::Cancel(task_id) => self.cancel(task_id).await,
            ControlRequest::SetPaused(task_id, paused) => {
                let Some(handle) = self.running.get_mut(&task_id) else {
                    tracing::debug!(task_id = %task_id, "Pause request for task that is not running");
                    return;
                };
                handle.request_pause(paused);
                self.set_paused_flag(task_id, paused).await;
            }
            ControlRequest::TogglePauseAll => {
                self.all_paused = !self.all_paused;
                let paused = self.all_paused;
                let ids: Vec<TaskId> = self.running.keys().copied().collect();
                for task_id in ids {
                    if let Some(handle) = self.running.get_mut(&task_id) {
                        handle.request_pause(paused);
                    }
                    self.set_paused_flag(task_id, paused).await;
                }
                tracing::info!(paused, "Pause toggled for all running tasks");
            }
            ControlRequest::SetAutoscroll(enabled) => self.set_autoscroll(enabled),
            ControlRequest::ToggleAutoscroll => self.set_autoscroll(!self.autoscroll),
            ControlRequest::Quit => self.quit_requested = true,
        }
    }

    async fn cancel(&mut self, task_id: TaskId) {
        if let Some(handle) = self.running.get_mut(&task_id) {
            handle.request_cancel();
            tracing::info!(task_id = %task_id, "Cancellation requested");
            return;
        }

        if let Some(pos) = self.pending.iter().position(|(id, _)| *id == task_id) {
            self.pending.remove(pos);
            self.mark(task_id, TaskState::Cancelled, "cancelled before start", None)
                .await;
            tracing::info!(task_id = %task_id, "Pending task cancelled");
            return;
        }

        tracing::debug!(task_id = %task_id, "Cancel request for task that is not active");
    }

    fn set_autoscroll(&mut self, enabled: bool) {
        self.autoscroll = enabled;
        self.board
            .emit(ProgressEvent::AutoscrollChanged { enabled });
    }

    async fn set_paused_flag(&self, task_id: TaskId, paused: bool) {
        if let Err(e) = self.board.set_paused(task_id, paused).await {
            tracing::warn!(task_id = %task_id, error = %e, "Could not record pause state");
        }
    }

    async fn service_running(&mut self) {
        for handle in self.running.values_mut() {
            handle.service(&self.board).await;
        }
    }

    /// Collect finished tasks and refill their slots.
    async fn reap_finished(&mut self) {
        let done: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        if done.is_empty() {
            return;
        }

        let handles: Vec<TaskHandle<T>> = done
            .iter()
            .filter_map(|id| self.running.remove(id))
            .collect();

        let board = Arc::clone(&self.board);
        let board = board.as_ref();
        let outcomes = join_all(handles.into_iter().map(|handle| async move {
            let task_id = handle.task_id();
            (task_id, handle.finish(board).await)
        }))
        .await;

        for (task_id, outcome) in outcomes {
            self.complete(task_id, outcome).await;
        }
        self.admit().await;
    }

    async fn complete(&mut self, task_id: TaskId, outcome: TaskOutcome<T>) {
        // Only a success is guaranteed to show the bar at its total.
        let total = match self.board.get(task_id).await {
            Ok(record) => record.total,
            Err(_) => 0.0,
        };
        self.board
            .update_value(task_id, total, outcome.is_success())
            .await;

        match outcome {
            TaskOutcome::Succeeded(value) => {
                self.results.insert(task_id, value);
                self.mark(task_id, TaskState::Succeeded, "task returned", None)
                    .await;
                tracing::info!(task_id = %task_id, "Task succeeded");
            }
            TaskOutcome::Cancelled => {
                self.mark(task_id, TaskState::Cancelled, "interrupted at checkpoint", None)
                    .await;
                tracing::info!(task_id = %task_id, "Task cancelled");
            }
            TaskOutcome::Failed(error) => {
                tracing::error!(task_id = %task_id, error = %error, "Task failed");
                self.mark(task_id, TaskState::Failed, "task raised an error", Some(error))
                    .await;
            }
        }

        if self.autoscroll {
            self.board.emit(ProgressEvent::Focus {
                task_id: self.focus_row(),
            });
        }
    }

    /// Row just past the highest finished result, clamped to the last task.
    fn focus_row(&self) -> TaskId {
        let last = self.next_id.saturating_sub(1);
        let next = self
            .results
            .keys()
            .next_back()
            .map(|id| id.0 + 1)
            .unwrap_or(0);
        TaskId(next.min(last))
    }

    async fn mark(&self, task_id: TaskId, state: TaskState, reason: &str, error: Option<String>) {
        if let Err(e) = self
            .board
            .transition(task_id, state, Some(reason.to_string()), error)
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "Could not record task state");
        }
    }

    fn declare_finished(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.board.emit(ProgressEvent::AllFinished);
        tracing::info!(results = self.results.len(), "All tasks finished");
    }
}

impl<T> Drop for Orchestrator<T> {
    fn drop(&mut self) {
        // Tasks still running when the orchestrator goes away are told to
        // stop; the message stays queued after the channel closes.
        for handle in self.running.values_mut() {
            handle.interrupt_now();
        }
    }
}
