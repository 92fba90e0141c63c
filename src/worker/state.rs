//! Task state machine.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::task::{ProgressMode, TaskId};

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued, waiting for a free slot.
    Pending,
    /// Admitted and executing on a worker thread.
    Running,
    /// The task body returned a value.
    Succeeded,
    /// Stopped after a cancellation request.
    Cancelled,
    /// The task body returned an error or panicked.
    Failed,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Live record of one task, as seen by observers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    pub description: String,
    /// Expected total work units.
    pub total: f64,
    /// Last value forwarded to observers.
    pub value: f64,
    pub mode: ProgressMode,
    /// Whether the task has been asked to pause.
    pub paused: bool,
    /// Failure detail for `Failed` tasks.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
    /// When the last value was forwarded (drives update gating).
    #[serde(skip)]
    pub last_forwarded: Option<Instant>,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        description: impl Into<String>,
        total: f64,
        mode: ProgressMode,
    ) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            description: description.into(),
            total,
            value: 0.0,
            mode,
            paused: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            transitions: Vec::new(),
            last_forwarded: None,
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: TaskState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;

        match new_state {
            TaskState::Running => {
                self.started_at = Some(Utc::now());
            }
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled => {
                self.completed_at = Some(Utc::now());
                self.paused = false;
            }
            TaskState::Pending => {}
        }

        Ok(())
    }

    /// Get the duration since the task started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Fraction of the total reached by the last forwarded value.
    pub fn fraction(&self) -> f64 {
        if self.total > 0.0 {
            (self.value / self.total).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Running));
        assert!(TaskState::Pending.can_transition_to(TaskState::Cancelled));
        assert!(TaskState::Running.can_transition_to(TaskState::Succeeded));
        assert!(TaskState::Running.can_transition_to(TaskState::Failed));
        assert!(TaskState::Running.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!TaskState::Pending.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Running));
        assert!(!TaskState::Cancelled.can_transition_to(TaskState::Running));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Running));
        assert!(!TaskState::Running.can_transition_to(TaskState::Pending));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
    }

    #[test]
    fn record_transitions() {
        let mut record = TaskRecord::new(TaskId(0), "crunch", 10.0, ProgressMode::Automatic);
        assert_eq!(record.state, TaskState::Pending);

        record.transition_to(TaskState::Running, None).unwrap();
        assert!(record.started_at.is_some());
        assert!(record.elapsed().is_some());

        record
            .transition_to(TaskState::Succeeded, Some("returned".to_string()))
            .unwrap();
        assert!(record.completed_at.is_some());
        assert_eq!(record.transitions.len(), 2);
        assert_eq!(record.transitions[1].reason.as_deref(), Some("returned"));

        let err = record.transition_to(TaskState::Running, None).unwrap_err();
        assert_eq!(err, "Cannot transition from succeeded to running");
    }

    #[test]
    fn terminal_transition_clears_pause() {
        let mut record = TaskRecord::new(TaskId(1), "", 1.0, ProgressMode::Manual);
        record.transition_to(TaskState::Running, None).unwrap();
        record.paused = true;
        record.transition_to(TaskState::Cancelled, None).unwrap();
        assert!(!record.paused);
    }

    #[test]
    fn fraction_is_clamped() {
        let mut record = TaskRecord::new(TaskId(2), "", 4.0, ProgressMode::Automatic);
        record.value = 2.0;
        assert_eq!(record.fraction(), 0.5);
        record.value = 9.0;
        assert_eq!(record.fraction(), 1.0);
        record.total = 0.0;
        assert_eq!(record.fraction(), 0.0);
    }

    #[test]
    fn task_state_serde_roundtrip() {
        let json = serde_json::to_string(&TaskState::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let parsed: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskState::Cancelled);
    }
}
