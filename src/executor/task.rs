use futures_util::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::infrastructure::error::TaskError;

pub type TaskFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// A zero-argument async unit of work.
///
/// The executor calls the wrapped closure once per attempt, so a retried task
/// starts from a fresh future every time.
pub struct Task<T> {
    label: Option<String>,
    factory: Arc<dyn Fn() -> TaskFuture<T> + Send + Sync>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            label: None,
            factory: Arc::new(move || f().boxed()),
        }
    }

    /// Name used in logs and errors instead of `task-<index>`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl<T> Task<T> {
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Start a new attempt.
    pub fn attempt(&self) -> TaskFuture<T> {
        (self.factory)()
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("label", &self.label).finish_non_exhaustive()
    }
}

/// Settled state of one batch slot.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed(TaskError),
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            TaskOutcome::Succeeded { value, .. } => Some(value),
            TaskOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Succeeded { .. } => None,
            TaskOutcome::Failed(err) => Some(err),
        }
    }

    /// Attempts used by a successful task; `None` for failures.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            TaskOutcome::Succeeded { attempts, .. } => Some(*attempts),
            TaskOutcome::Failed(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            TaskOutcome::Succeeded { value, .. } => Some(value),
            TaskOutcome::Failed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            TaskOutcome::Succeeded { value, .. } => Ok(value),
            TaskOutcome::Failed(err) => Err(err),
        }
    }
}

/// Ordered outcomes of a batch, one slot per submitted task.
pub type ExecutionResult<T> = Vec<TaskOutcome<T>>;
