//! Bounded-concurrency task execution with per-attempt timeouts and retries.

pub mod parallel;
pub mod policy;
pub mod task;

pub use parallel::{ExecutorStats, ProgressCallback, TaskExecutor};
pub use policy::{default_worker_count, Backoff, ExecutorPolicy};
pub use task::{ExecutionResult, Task, TaskFuture, TaskOutcome};
