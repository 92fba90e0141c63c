//! Progress events broadcast to observers (progress displays, loggers).

use serde::{Deserialize, Serialize};

use crate::worker::state::TaskState;
use crate::worker::task::TaskId;

/// Events emitted while an orchestrator runs.
///
/// Value updates are already gated by the update throttle; everything else
/// is forwarded as it happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A task was registered.
    TaskAdded {
        task_id: TaskId,
        description: String,
        total: f64,
    },
    /// A task was admitted and started running.
    Started { task_id: TaskId },
    /// A task's description changed.
    Name { task_id: TaskId, name: String },
    /// A task's expected total changed.
    Total { task_id: TaskId, total: f64 },
    /// A task's progress value changed.
    Value { task_id: TaskId, value: f64 },
    /// A pause or resume was requested for a task.
    Paused { task_id: TaskId, paused: bool },
    /// A task reached a terminal state.
    Finished {
        task_id: TaskId,
        status: TaskState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Row a display should bring into view.
    Focus { task_id: TaskId },
    /// Autoscroll was switched on or off.
    AutoscrollChanged { enabled: bool },
    /// Every task is terminal.
    AllFinished,
}

impl ProgressEvent {
    /// Get the task ID, for task-scoped variants.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskAdded { task_id, .. }
            | Self::Started { task_id }
            | Self::Name { task_id, .. }
            | Self::Total { task_id, .. }
            | Self::Value { task_id, .. }
            | Self::Paused { task_id, .. }
            | Self::Finished { task_id, .. }
            | Self::Focus { task_id } => Some(*task_id),
            Self::AutoscrollChanged { .. } | Self::AllFinished => None,
        }
    }

    /// Whether this event ends a task or the whole run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::AllFinished)
    }

    /// Event type name (matches the serde tag).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task_added",
            Self::Started { .. } => "started",
            Self::Name { .. } => "name",
            Self::Total { .. } => "total",
            Self::Value { .. } => "value",
            Self::Paused { .. } => "paused",
            Self::Finished { .. } => "finished",
            Self::Focus { .. } => "focus",
            Self::AutoscrollChanged { .. } => "autoscroll_changed",
            Self::AllFinished => "all_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tag_matches_event_type() {
        let events = [
            ProgressEvent::Started { task_id: TaskId(1) },
            ProgressEvent::Value {
                task_id: TaskId(1),
                value: 2.0,
            },
            ProgressEvent::Finished {
                task_id: TaskId(1),
                status: TaskState::Failed,
                error: Some("boom".to_string()),
            },
            ProgressEvent::AllFinished,
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
            let parsed: ProgressEvent = serde_json::from_value(json).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn finished_without_error_omits_field() {
        let event = ProgressEvent::Finished {
            task_id: TaskId(0),
            status: TaskState::Succeeded,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"finished","task_id":0,"status":"succeeded"}"#
        );
    }

    #[test]
    fn task_scoping() {
        assert_eq!(
            ProgressEvent::Focus { task_id: TaskId(4) }.task_id(),
            Some(TaskId(4))
        );
        assert_eq!(ProgressEvent::AllFinished.task_id(), None);
        assert!(ProgressEvent::AllFinished.is_terminal());
        assert!(!ProgressEvent::AutoscrollChanged { enabled: true }.is_terminal());
    }
}
