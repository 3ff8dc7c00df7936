use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::infrastructure::error::ConfigError;

/// Default worker count: one less than the number of CPU cores, at least 1.
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Concurrency, timeout and retry policy for [`TaskExecutor`](super::TaskExecutor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorPolicy {
    /// Upper bound on attempts running at the same time
    pub max_workers: usize,
    /// Deadline for a single attempt, in milliseconds
    pub timeout_millis: u64,
    /// Whether failed attempts are retried at all
    pub retry_failed: bool,
    /// Additional attempts after the first one
    pub max_retries: u32,
    /// Delay inserted before each retry
    pub backoff: Backoff,
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            max_workers: default_worker_count(),
            timeout_millis: 30_000,
            retry_failed: true,
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl ExecutorPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    /// Worker count actually used, clamped to `1..=Semaphore::MAX_PERMITS`.
    pub fn effective_workers(&self) -> usize {
        self.max_workers.clamp(1, Semaphore::MAX_PERMITS)
    }

    /// Total attempts a single task may get, including the first.
    pub fn max_attempts(&self) -> u32 {
        if self.retry_failed {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_millis == 0 {
            return Err(ConfigError::invalid(
                "executor.timeout_millis",
                "per-attempt timeout must be greater than zero",
            ));
        }
        self.backoff.validate()
    }
}

/// Delay strategy applied before each retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// `2^retry * base_millis`, optionally capped and jittered by ±10%
    Exponential {
        base_millis: u64,
        #[serde(default)]
        max_millis: Option<u64>,
        #[serde(default)]
        jitter: bool,
    },
    Fixed { delay_millis: u64 },
    None,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_millis: 100,
            max_millis: None,
            jitter: false,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry`, counting from 1.
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Exponential {
                base_millis,
                max_millis,
                jitter,
            } => {
                let factor = 2u64.checked_pow(retry).unwrap_or(u64::MAX);
                let mut millis = base_millis.saturating_mul(factor);

                if let Some(max) = max_millis {
                    millis = millis.min(*max);
                }

                if *jitter {
                    let jitter_range = millis as f64 * 0.1;
                    let offset = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
                    millis = (millis as f64 + offset).max(0.0) as u64;
                }

                Duration::from_millis(millis)
            }
            Backoff::Fixed { delay_millis } => Duration::from_millis(*delay_millis),
            Backoff::None => Duration::ZERO,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Backoff::Exponential {
                base_millis,
                max_millis: Some(max),
                ..
            } if max < base_millis => Err(ConfigError::invalid(
                "executor.backoff.max_millis",
                format!("cap {max}ms is below the base delay {base_millis}ms"),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ExecutorPolicy::default();
        assert!(policy.max_workers >= 1);
        assert_eq!(policy.timeout(), Duration::from_secs(30));
        assert!(policy.retry_failed);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_zero_workers_is_clamped() {
        let policy = ExecutorPolicy {
            max_workers: 0,
            ..Default::default()
        };
        assert_eq!(policy.effective_workers(), 1);
    }

    #[test]
    fn test_oversized_worker_count_is_clamped() {
        let policy = ExecutorPolicy {
            max_workers: usize::MAX,
            ..Default::default()
        };
        assert_eq!(policy.effective_workers(), Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_retry_disabled_allows_single_attempt() {
        let policy = ExecutorPolicy {
            retry_failed: false,
            max_retries: 5,
            ..Default::default()
        };
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_default_backoff_doubles_from_200ms() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_cap_and_overflow() {
        let capped = Backoff::Exponential {
            base_millis: 100,
            max_millis: Some(500),
            jitter: false,
        };
        assert_eq!(capped.delay(10), Duration::from_millis(500));

        let huge = Backoff::default();
        assert_eq!(huge.delay(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let backoff = Backoff::Exponential {
            base_millis: 1000,
            max_millis: None,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff.delay(1).as_millis();
            assert!((1800..=2200).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_validation() {
        let policy = ExecutorPolicy {
            timeout_millis: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let policy = ExecutorPolicy {
            backoff: Backoff::Exponential {
                base_millis: 100,
                max_millis: Some(50),
                jitter: false,
            },
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        assert!(ExecutorPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: ExecutorPolicy = serde_yaml::from_str(
            "max_workers: 2\nmax_retries: 1\nbackoff:\n  strategy: fixed\n  delay_millis: 5\n",
        )
        .unwrap();
        assert_eq!(policy.max_workers, 2);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.timeout_millis, 30_000);
        assert_eq!(policy.backoff, Backoff::Fixed { delay_millis: 5 });
    }
}
