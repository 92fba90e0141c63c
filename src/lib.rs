//! Progress Pool — run a batch of blocking tasks with bounded parallelism
//! and live, throttled progress reporting.

pub mod config;
pub mod error;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{Error, Interrupted};
pub use worker::{Orchestrator, OrchestratorController, Progress, ProgressEvent, TaskId, TaskSpec};
