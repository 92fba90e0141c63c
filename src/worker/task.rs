//! Task descriptors — what the caller registers and what comes back.

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::worker::progress::Progress;

/// Identifier assigned at enqueue time, zero-based and monotonic per orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task reports its progress. Fixed when the task is registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Values are reported by iterating through [`Progress::iterate`].
    #[default]
    Automatic,
    /// Values are reported explicitly through [`Progress::set_value`].
    Manual,
}

/// Positional and keyword arguments handed to a task body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Deserialize the positional argument at `index`.
    pub fn arg<A: DeserializeOwned>(&self, index: usize) -> anyhow::Result<A> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("missing positional argument {index}"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("invalid positional argument {index}"))
    }

    /// Deserialize the keyword argument `name`.
    pub fn kwarg<A: DeserializeOwned>(&self, name: &str) -> anyhow::Result<A> {
        let value = self
            .kwargs
            .get(name)
            .with_context(|| format!("missing keyword argument '{name}'"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("invalid keyword argument '{name}'"))
    }

    /// Deserialize the keyword argument `name`, or return `default` if absent.
    pub fn kwarg_or<A: DeserializeOwned>(&self, name: &str, default: A) -> anyhow::Result<A> {
        if self.kwargs.contains_key(name) {
            self.kwarg(name)
        } else {
            Ok(default)
        }
    }
}

/// Boxed task body.
pub type TaskFn<T> = Box<dyn FnOnce(TaskArgs, &Progress) -> anyhow::Result<T> + Send + 'static>;

/// A task waiting to be registered with an orchestrator.
pub struct TaskSpec<T> {
    pub(crate) func: TaskFn<T>,
    pub(crate) args: TaskArgs,
    pub(crate) description: String,
    pub(crate) total: f64,
    pub(crate) mode: ProgressMode,
}

impl<T> TaskSpec<T> {
    /// Wrap a task body. Description defaults to empty and total to 1.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce(TaskArgs, &Progress) -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            func: Box::new(func),
            args: TaskArgs::default(),
            description: String::new(),
            total: 1.0,
            mode: ProgressMode::Automatic,
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args.args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.args.kwargs = kwargs;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn total(mut self, total: f64) -> Self {
        self.total = total;
        self
    }

    /// Report progress through [`Progress::set_value`] instead of iteration.
    pub fn manual(mut self) -> Self {
        self.mode = ProgressMode::Manual;
        self
    }

    pub fn mode(&self) -> ProgressMode {
        self.mode
    }
}

impl<T> std::fmt::Debug for TaskSpec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("args", &self.args)
            .field("description", &self.description)
            .field("total", &self.total)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// How a task ended.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The body returned a value.
    Succeeded(T),
    /// The body stopped at a checkpoint after a cancellation request.
    Cancelled,
    /// The body returned an error or panicked.
    Failed(String),
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}
