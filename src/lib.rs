//! Bounded-concurrency batch execution with retries, a TTL file cache and a
//! process memory advisor.

pub mod cache;
pub mod cli;
pub mod executor;
pub mod infrastructure;
pub mod memory;

pub use cache::{CacheConfig, CacheStore};
pub use executor::{Backoff, ExecutionResult, ExecutorPolicy, ProgressCallback, Task, TaskExecutor, TaskOutcome};
pub use infrastructure::{BatchFailed, CoreConfig, PeriodicHandle, TaskError};
pub use memory::{MemoryAdvisor, MemoryConfig, MemorySample};
