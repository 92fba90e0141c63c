//! Worker system — batched task execution with live progress.
//!
//! Core components:
//! - `task` — Task specs, IDs, arguments and outcomes
//! - `channel` — Duplex message channel between a task and the control loop
//! - `progress` — In-task progress emitter (`iterate`, `set_value`, checkpoints)
//! - `handle` — Control-loop side of one running task
//! - `state` — Task state machine (Pending → Running → Succeeded/Cancelled/Failed)
//! - `throttle` — Gating for forwarded value updates
//! - `board` — Shared task records and the progress event broadcast
//! - `events` — Progress events for displays and loggers
//! - `scheduler` — Orchestrator: admission, control loop, teardown

pub mod board;
pub mod channel;
pub mod events;
pub mod handle;
pub mod progress;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod throttle;

pub use board::{BoardSummary, ProgressBoard};
pub use events::ProgressEvent;
pub use progress::{Progress, Tracked};
pub use scheduler::{ControlRequest, Orchestrator, OrchestratorController};
pub use state::{TaskRecord, TaskState};
pub use task::{ProgressMode, TaskArgs, TaskFn, TaskId, TaskOutcome, TaskSpec};
pub use throttle::Throttle;
