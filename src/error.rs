//! Error types for the progress pool.

use crate::worker::task::TaskId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Orchestrator-level errors. Per-task failures never show up here.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Tasks have already been processed by this orchestrator")]
    AlreadyProcessed,

    #[error("Task {id} not found")]
    TaskNotFound { id: TaskId },

    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: TaskId,
        state: String,
        target: String,
    },

    #[error("Control loop is no longer running")]
    ControlLoopClosed,
}

/// Progress channel errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The other end of the channel is gone. Benign: the task already finished.
    #[error("Channel closed")]
    Closed,

    #[error("Protocol violation on task {id}: {reason}")]
    ProtocolViolation { id: TaskId, reason: String },
}

/// Raised inside a task when the control side asks it to stop.
///
/// Task bodies propagate it with `?`; the task handle recognizes it and
/// reports the task as cancelled rather than failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Task interrupted by cancellation request")]
pub struct Interrupted;

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_survives_anyhow_round_trip() {
        let err: anyhow::Error = Interrupted.into();
        assert!(err.downcast_ref::<Interrupted>().is_some());

        let wrapped = err.context("while crunching");
        assert!(wrapped.downcast_ref::<Interrupted>().is_some());
    }

    #[test]
    fn error_display() {
        let err = Error::from(OrchestratorError::TaskNotFound { id: TaskId(7) });
        assert_eq!(err.to_string(), "Orchestrator error: Task 7 not found");

        let err = Error::from(ConfigError::InvalidValue {
            key: "batch_size".to_string(),
            message: "must be at least 1".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration value for batch_size: must be at least 1"
        );
    }
}
