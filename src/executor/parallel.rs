use futures_util::future::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::policy::ExecutorPolicy;
use super::task::{ExecutionResult, Task, TaskOutcome};
use crate::infrastructure::error::{BatchFailed, ConfigError, TaskError};

/// Called with `(completed, total)` each time a batch slot settles.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Cumulative statistics across every batch run by one executor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub batches: u64,
    pub total_tasks: u64,
    pub succeeded_tasks: u64,
    pub failed_tasks: u64,
    pub total_attempts: u64,
    pub retried_attempts: u64,
    pub timed_out_attempts: u64,
    pub average_attempt_time: Duration,
    pub peak_in_flight: usize,
    pub current_in_flight: usize,
    #[serde(skip)]
    total_attempt_time: Duration,
}

/// State shared by every spawned task of an executor.
struct WorkerPool {
    policy: ExecutorPolicy,
    semaphore: Semaphore,
    stats: RwLock<ExecutorStats>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Runs batches of independent tasks with bounded concurrency, a deadline per
/// attempt and retry with backoff.
///
/// When an attempt times out its future is dropped, which cancels it at the
/// next suspension point. Work it handed off elsewhere (spawned tasks, threads)
/// is not cancelled and may outlive the attempt.
pub struct TaskExecutor {
    pool: Arc<WorkerPool>,
}

impl TaskExecutor {
    pub fn new(policy: ExecutorPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;

        let workers = policy.effective_workers();
        Ok(Self {
            pool: Arc::new(WorkerPool {
                semaphore: Semaphore::new(workers),
                policy,
                stats: RwLock::new(ExecutorStats::default()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        })
    }

    pub fn policy(&self) -> &ExecutorPolicy {
        &self.pool.policy
    }

    /// Run every task and return their values in submission order.
    ///
    /// If any task still fails after its retries, the whole call fails with a
    /// [`BatchFailed`] that lists every terminal failure and keeps the values of
    /// the tasks that did succeed.
    pub async fn execute_parallel<T>(
        &self,
        tasks: Vec<Task<T>>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Vec<T>, BatchFailed<T>>
    where
        T: Send + 'static,
    {
        let outcomes = self.execute_settled(tasks, on_progress).await;

        if outcomes.iter().all(TaskOutcome::is_success) {
            return Ok(outcomes.into_iter().filter_map(TaskOutcome::into_value).collect());
        }

        let batch = BatchFailed::new(outcomes);
        error!(failed = batch.failed(), total = batch.total(), "batch failed");
        Err(batch)
    }

    /// Run every task and return one tagged outcome per task, in submission
    /// order. Never fails as a whole.
    pub async fn execute_settled<T>(
        &self,
        tasks: Vec<Task<T>>,
        on_progress: Option<ProgressCallback>,
    ) -> ExecutionResult<T>
    where
        T: Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let span = info_span!("batch", batch_id = %Uuid::new_v4(), total);
        self.run_batch(tasks, on_progress).instrument(span).await
    }

    async fn run_batch<T>(&self, tasks: Vec<Task<T>>, on_progress: Option<ProgressCallback>) -> ExecutionResult<T>
    where
        T: Send + 'static,
    {
        let total = tasks.len();
        let started = Instant::now();

        info!(workers = self.pool.policy.effective_workers(), "starting batch");

        {
            let mut stats = self.pool.stats.write().await;
            stats.batches += 1;
            stats.total_tasks += total as u64;
        }

        let mut guard = AbortOnDrop::default();
        let mut running = FuturesUnordered::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let label = task
                .label()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("task-{index}"));
            let pool = Arc::clone(&self.pool);

            let handle = tokio::spawn(pool.run_with_retries(label.clone(), task).in_current_span());
            guard.0.push(handle.abort_handle());

            running.push(async move { (index, label, handle.await) });
        }

        let mut slots: Vec<Option<TaskOutcome<T>>> = (0..total).map(|_| None).collect();
        let mut completed = 0;

        while let Some((index, label, joined)) = running.next().await {
            let outcome = joined.unwrap_or_else(|join_error| {
                error!(task = %label, error = %join_error, "task aborted");
                TaskOutcome::Failed(TaskError::Panicked {
                    task: label,
                    attempt: 0,
                    message: join_error.to_string(),
                })
            });

            slots[index] = Some(outcome);
            completed += 1;

            if let Some(callback) = &on_progress {
                callback(completed, total);
            }
        }

        guard.0.clear();

        let outcomes: ExecutionResult<T> = slots.into_iter().flatten().collect();
        debug_assert_eq!(outcomes.len(), total);

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            succeeded,
            failed = total - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );

        outcomes
    }

    /// Snapshot of the cumulative statistics.
    pub async fn stats(&self) -> ExecutorStats {
        let mut stats = self.pool.stats.read().await.clone();
        stats.peak_in_flight = self.pool.peak_in_flight.load(Ordering::SeqCst);
        stats.current_in_flight = self.pool.in_flight.load(Ordering::SeqCst);
        if stats.total_attempts > 0 {
            let nanos = stats.total_attempt_time.as_nanos() / u128::from(stats.total_attempts);
            stats.average_attempt_time = Duration::from_nanos(nanos as u64);
        }
        stats
    }
}

impl WorkerPool {
    async fn run_with_retries<T>(self: Arc<Self>, label: String, task: Task<T>) -> TaskOutcome<T>
    where
        T: Send + 'static,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            match self.run_attempt(&label, attempt, &task).await {
                Ok(value) => {
                    debug!(task = %label, attempt, "task succeeded");
                    self.stats.write().await.succeeded_tasks += 1;
                    return TaskOutcome::Succeeded { value, attempts: attempt };
                }
                Err(err) if attempt < max_attempts && err.is_retryable() => {
                    let delay = self.policy.backoff.delay(attempt);
                    warn!(
                        task = %label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    self.stats.write().await.retried_attempts += 1;

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    let err = if attempt > 1 {
                        TaskError::RetriesExhausted {
                            task: label.clone(),
                            retries: attempt - 1,
                            last: Box::new(err),
                        }
                    } else {
                        err
                    };

                    error!(task = %label, attempts = attempt, error = %err, "task failed");
                    self.stats.write().await.failed_tasks += 1;
                    return TaskOutcome::Failed(err);
                }
            }
        }
    }

    /// One attempt under a worker permit and a fresh deadline.
    async fn run_attempt<T>(&self, label: &str, attempt: u32, task: &Task<T>) -> Result<T, TaskError>
    where
        T: Send + 'static,
    {
        let _permit = self.semaphore.acquire().await.map_err(|_| TaskError::Failed {
            task: label.to_string(),
            attempt,
            source: anyhow::anyhow!("worker pool closed"),
        })?;

        let in_flight = InFlight::enter(&self.in_flight);
        let current = in_flight.current;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        debug!(task = %label, attempt, in_flight = current, "attempt started");

        let started = Instant::now();
        let timeout = self.policy.timeout();
        let result = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(async { task.attempt().await }).catch_unwind(),
        )
        .await;
        let elapsed = started.elapsed();

        drop(in_flight);

        let mut stats = self.stats.write().await;
        stats.total_attempts += 1;
        stats.total_attempt_time += elapsed;

        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(source))) => Err(TaskError::Failed {
                task: label.to_string(),
                attempt,
                source,
            }),
            Ok(Err(panic)) => Err(TaskError::Panicked {
                task: label.to_string(),
                attempt,
                message: panic_message(panic.as_ref()),
            }),
            Err(_) => {
                stats.timed_out_attempts += 1;
                Err(TaskError::Timeout {
                    task: label.to_string(),
                    attempt,
                    timeout_millis: self.policy.timeout_millis,
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Counts an attempt as in flight until dropped, including on abort.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    current: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aborts still-running tasks if the batch future is dropped mid-flight.
#[derive(Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}
