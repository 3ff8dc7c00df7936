use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::executor::TaskOutcome;

/// Failure of a single task, either for one attempt or terminally.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{task} timed out on attempt {attempt} after {timeout_millis}ms")]
    Timeout {
        task: String,
        attempt: u32,
        timeout_millis: u64,
    },

    #[error("{task} failed on attempt {attempt}: {source}")]
    Failed {
        task: String,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{task} panicked on attempt {attempt}: {message}")]
    Panicked {
        task: String,
        attempt: u32,
        message: String,
    },

    #[error("{task} failed after {retries} retries: {last}")]
    RetriesExhausted {
        task: String,
        retries: u32,
        #[source]
        last: Box<TaskError>,
    },
}

impl TaskError {
    /// Label of the task this error belongs to
    pub fn task(&self) -> &str {
        match self {
            TaskError::Timeout { task, .. }
            | TaskError::Failed { task, .. }
            | TaskError::Panicked { task, .. }
            | TaskError::RetriesExhausted { task, .. } => task,
        }
    }

    /// Whether the executor may schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::RetriesExhausted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            TaskError::Timeout { .. } => true,
            TaskError::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// The attempt-level error at the bottom of a retry chain.
    pub fn root(&self) -> &TaskError {
        match self {
            TaskError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Aggregate failure of an `execute_parallel` batch.
///
/// Wraps the ordered outcomes of the whole batch, so successful slots stay
/// visible to the caller next to every terminal failure.
#[derive(Debug)]
pub struct BatchFailed<T> {
    outcomes: Vec<TaskOutcome<T>>,
}

impl<T> BatchFailed<T> {
    pub fn new(outcomes: Vec<TaskOutcome<T>>) -> Self {
        Self { outcomes }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    /// Terminal failures in submission order, with their slot index.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &TaskError)> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.error().map(|err| (index, err)))
    }

    /// One message per terminal failure, in submission order.
    pub fn messages(&self) -> Vec<String> {
        self.failures().map(|(_, err)| err.to_string()).collect()
    }

    /// Values of the tasks that did succeed, keeping their slot index.
    pub fn successes(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.value().map(|value| (index, value)))
    }

    pub fn outcomes(&self) -> &[TaskOutcome<T>] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<TaskOutcome<T>> {
        self.outcomes
    }
}

impl<T> fmt::Display for BatchFailed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} tasks failed", self.failed(), self.total())?;
        for (i, (_, failure)) in self.failures().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl<T: fmt::Debug> std::error::Error for BatchFailed<T> {}

/// Cache store failures. These are logged by the store and never returned
/// from its public operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to read cache entry {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write cache entry {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare cache directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize value for cache key {key:?}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt cache entry {}: {source}", .path.display())]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{format} parse error in {}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        format: &'static str,
        message: String,
    },

    #[error("unsupported config file format: {}", .path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, format: &'static str, message: impl fmt::Display) -> Self {
        ConfigError::Parse {
            path: path.into(),
            format,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_exhausted_keeps_root_cause() {
        let err = TaskError::RetriesExhausted {
            task: "task-1".to_string(),
            retries: 3,
            last: Box::new(TaskError::Timeout {
                task: "task-1".to_string(),
                attempt: 4,
                timeout_millis: 50,
            }),
        };

        assert!(err.is_timeout());
        assert!(!err.is_retryable());
        assert!(matches!(err.root(), TaskError::Timeout { attempt: 4, .. }));
        assert_eq!(err.task(), "task-1");
        assert_eq!(
            err.to_string(),
            "task-1 failed after 3 retries: task-1 timed out on attempt 4 after 50ms"
        );
    }

    #[test]
    fn test_batch_failed_lists_every_failure() {
        let batch = BatchFailed::new(vec![
            TaskOutcome::Failed(TaskError::Failed {
                task: "task-0".to_string(),
                attempt: 1,
                source: anyhow::anyhow!("boom"),
            }),
            TaskOutcome::Succeeded { value: 7, attempts: 1 },
            TaskOutcome::Failed(TaskError::Panicked {
                task: "task-2".to_string(),
                attempt: 1,
                message: "oops".to_string(),
            }),
        ]);

        assert_eq!(batch.total(), 3);
        assert_eq!(batch.failed(), 2);
        assert_eq!(
            batch.to_string(),
            "2 of 3 tasks failed: task-0 failed on attempt 1: boom; task-2 panicked on attempt 1: oops"
        );
        assert_eq!(batch.successes().collect::<Vec<_>>(), vec![(1, &7)]);
        assert_eq!(batch.failures().map(|(i, _)| i).collect::<Vec<_>>(), vec![0, 2]);
    }
}
