//! Progress board — live task records shared between the control loop and
//! observers.
//!
//! Every update from a task passes through the gated entry points here
//! (`update_name`, `update_total`, `update_value`), serialized by the board's
//! lock, and is re-broadcast as a [`ProgressEvent`].

use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::{RwLock, broadcast};

use crate::error::{ChannelError, OrchestratorError};
use crate::worker::events::ProgressEvent;
use crate::worker::state::{TaskRecord, TaskState};
use crate::worker::task::TaskId;
use crate::worker::throttle::Throttle;

/// Broadcast capacity for progress events.
const EVENT_CAPACITY: usize = 1024;

/// Shared view of every task's progress and state.
pub struct ProgressBoard {
    records: RwLock<BTreeMap<TaskId, TaskRecord>>,
    throttle: Throttle,
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBoard {
    pub fn new(throttle: Throttle) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            throttle,
            tx,
        }
    }

    /// Subscribe to progress events. Lagging subscribers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn throttle(&self) -> Throttle {
        self.throttle
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Add a freshly queued task.
    pub async fn register(&self, record: TaskRecord) {
        let event = ProgressEvent::TaskAdded {
            task_id: record.task_id,
            description: record.description.clone(),
            total: record.total,
        };
        self.records.write().await.insert(record.task_id, record);
        self.emit(event);
    }

    /// Get a task record by ID.
    pub async fn get(&self, task_id: TaskId) -> Result<TaskRecord, OrchestratorError> {
        self.records
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(OrchestratorError::TaskNotFound { id: task_id })
    }

    /// All records, ordered by task ID.
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Count of tasks per state.
    pub async fn summary(&self) -> BoardSummary {
        let records = self.records.read().await;

        let mut summary = BoardSummary::default();
        for record in records.values() {
            match record.state {
                TaskState::Pending => summary.pending += 1,
                TaskState::Running => summary.running += 1,
                TaskState::Succeeded => summary.succeeded += 1,
                TaskState::Cancelled => summary.cancelled += 1,
                TaskState::Failed => summary.failed += 1,
            }
        }

        summary.total = records.len();
        summary
    }

    /// Forward a description change.
    pub async fn update_name(&self, task_id: TaskId, name: impl Into<String>) {
        let name = name.into();
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&task_id) else {
            violation(task_id, "name update for unknown task");
            return;
        };
        record.description = name.clone();
        drop(records);

        self.emit(ProgressEvent::Name { task_id, name });
    }

    /// Forward a total change.
    pub async fn update_total(&self, task_id: TaskId, total: f64) {
        if !total.is_finite() {
            violation(task_id, format!("non-finite total {total}"));
            return;
        }
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&task_id) else {
            violation(task_id, "total update for unknown task");
            return;
        };
        record.total = total;
        drop(records);

        self.emit(ProgressEvent::Total { task_id, total });
    }

    /// Forward a value change if the throttle allows it (or `force` is set).
    /// Returns whether the update was forwarded.
    pub async fn update_value(&self, task_id: TaskId, value: f64, force: bool) -> bool {
        if !value.is_finite() {
            violation(task_id, format!("non-finite value {value}"));
            return false;
        }
        let now = Instant::now();
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&task_id) else {
            violation(task_id, "value update for unknown task");
            return false;
        };

        let allowed = force
            || self.throttle.allows(
                record.last_forwarded,
                record.value,
                value,
                record.total,
                now,
            );
        if !allowed {
            return false;
        }

        record.value = value;
        record.last_forwarded = Some(now);
        drop(records);

        self.emit(ProgressEvent::Value { task_id, value });
        true
    }

    /// Record a pause or resume request for a task.
    pub async fn set_paused(&self, task_id: TaskId, paused: bool) -> Result<(), OrchestratorError> {
        self.update_record(task_id, |record| record.paused = paused)
            .await?;
        self.emit(ProgressEvent::Paused { task_id, paused });
        Ok(())
    }

    /// Move a task through the state machine and announce it.
    pub async fn transition(
        &self,
        task_id: TaskId,
        state: TaskState,
        reason: Option<String>,
        error: Option<String>,
    ) -> Result<(), OrchestratorError> {
        self.update_record(task_id, |record| {
            record.transition_to(state, reason).map_err(|_| {
                OrchestratorError::InvalidTransition {
                    id: task_id,
                    state: record.state.to_string(),
                    target: state.to_string(),
                }
            })?;
            record.error = error.clone();
            Ok(())
        })
        .await??;

        match state {
            TaskState::Running => self.emit(ProgressEvent::Started { task_id }),
            s if s.is_terminal() => self.emit(ProgressEvent::Finished {
                task_id,
                status: s,
                error,
            }),
            _ => {}
        }
        Ok(())
    }

    async fn update_record<F, R>(&self, task_id: TaskId, f: F) -> Result<R, OrchestratorError>
    where
        F: FnOnce(&mut TaskRecord) -> R,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&task_id)
            .ok_or(OrchestratorError::TaskNotFound { id: task_id })?;
        Ok(f(record))
    }
}

fn violation(task_id: TaskId, reason: impl Into<String>) {
    let err = ChannelError::ProtocolViolation {
        id: task_id,
        reason: reason.into(),
    };
    tracing::warn!(task_id = %task_id, error = %err, "Ignoring progress update");
}

/// Summary of all task records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BoardSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub cancelled: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::worker::task::ProgressMode;

    fn board() -> ProgressBoard {
        ProgressBoard::new(Throttle::new(Duration::ZERO, Some(0.0)))
    }

    async fn board_with_task(board: &ProgressBoard, id: u64, total: f64) -> TaskId {
        let task_id = TaskId(id);
        board
            .register(TaskRecord::new(task_id, "task", total, ProgressMode::Automatic))
            .await;
        task_id
    }

    #[tokio::test]
    async fn register_broadcasts_task_added() {
        let board = board();
        let mut rx = board.subscribe();
        let id = board_with_task(&board, 0, 5.0).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::TaskAdded {
                task_id: id,
                description: "task".to_string(),
                total: 5.0,
            }
        );
        assert_eq!(board.len().await, 1);
    }

    #[tokio::test]
    async fn value_updates_are_gated() {
        let board = ProgressBoard::new(Throttle::new(Duration::ZERO, Some(2.0)));
        let id = board_with_task(&board, 0, 10.0).await;

        assert!(!board.update_value(id, 1.0, false).await);
        assert!(board.update_value(id, 2.0, false).await);
        assert!(!board.update_value(id, 3.0, false).await);
        assert!(board.update_value(id, 3.0, true).await);
        assert_eq!(board.get(id).await.unwrap().value, 3.0);
    }

    #[tokio::test]
    async fn interval_gate_uses_last_forwarded_time() {
        let board = ProgressBoard::new(Throttle::new(Duration::from_secs(60), Some(0.0)));
        let id = board_with_task(&board, 0, 10.0).await;

        assert!(board.update_value(id, 1.0, false).await);
        assert!(!board.update_value(id, 2.0, false).await);
        assert!(board.update_value(id, 10.0, true).await);
    }

    #[tokio::test]
    async fn repeated_name_and_total_are_idempotent() {
        let board = board();
        let id = board_with_task(&board, 0, 1.0).await;

        board.update_total(id, 8.0).await;
        board.update_name(id, "crunch").await;
        let once = board.get(id).await.unwrap();

        for _ in 0..3 {
            board.update_total(id, 8.0).await;
            board.update_name(id, "crunch").await;
        }
        let many = board.get(id).await.unwrap();

        assert_eq!(once.total, many.total);
        assert_eq!(once.description, many.description);
        assert_eq!(many.description, "crunch");
    }

    #[tokio::test]
    async fn unknown_and_non_finite_updates_ignored() {
        let board = board();
        let id = board_with_task(&board, 0, 4.0).await;

        assert!(!board.update_value(TaskId(99), 1.0, true).await);
        assert!(!board.update_value(id, f64::NAN, true).await);
        board.update_total(id, f64::INFINITY).await;
        board.update_name(TaskId(99), "ghost").await;

        let record = board.get(id).await.unwrap();
        assert_eq!(record.total, 4.0);
        assert_eq!(record.value, 0.0);
    }

    #[tokio::test]
    async fn transitions_broadcast_lifecycle() {
        let board = board();
        let id = board_with_task(&board, 0, 1.0).await;
        let mut rx = board.subscribe();

        board
            .transition(id, TaskState::Running, None, None)
            .await
            .unwrap();
        board
            .transition(id, TaskState::Failed, None, Some("boom".to_string()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::Started { task_id: id });
        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::Finished {
                task_id: id,
                status: TaskState::Failed,
                error: Some("boom".to_string()),
            }
        );
        assert_eq!(board.get(id).await.unwrap().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let board = board();
        let id = board_with_task(&board, 0, 1.0).await;

        let err = board
            .transition(id, TaskState::Succeeded, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(board.get(id).await.unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn summary_counts_states() {
        let board = board();
        let a = board_with_task(&board, 0, 1.0).await;
        board_with_task(&board, 1, 1.0).await;
        board.transition(a, TaskState::Running, None, None).await.unwrap();

        let summary = board.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.running, 1);
    }

    #[tokio::test]
    async fn pause_flag_recorded() {
        let board = board();
        let id = board_with_task(&board, 0, 1.0).await;
        board.set_paused(id, true).await.unwrap();
        assert!(board.get(id).await.unwrap().paused);
        assert!(board.set_paused(TaskId(5), true).await.is_err());
    }
}
