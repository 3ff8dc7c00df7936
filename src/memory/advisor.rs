use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::probe::{MemoryProbe, MemoryUsage, ProcessMemoryProbe};
use crate::infrastructure::error::ConfigError;
use crate::infrastructure::periodic::{spawn_periodic, PeriodicHandle};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Runtime hook that releases unused memory.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// Memory advisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Heap usage (MB) above which reclamation is advised
    pub gc_threshold_mb: u64,
    /// Allow `optimize` to actually run the reclaim hook
    pub force_gc: bool,
    /// Informational ceiling used for `pressure_ratio`
    pub max_heap_size_mb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            gc_threshold_mb: 512,
            force_gc: false,
            max_heap_size_mb: None,
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_heap_size_mb == Some(0) {
            return Err(ConfigError::invalid(
                "memory.max_heap_size_mb",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Point-in-time memory snapshot in MB
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemorySample {
    pub heap_used_mb: f64,
    pub heap_total_mb: f64,
    pub external_mb: f64,
    pub rss_mb: f64,
    pub should_reclaim: bool,
}

impl MemorySample {
    fn from_usage(usage: MemoryUsage, gc_threshold_mb: u64) -> Self {
        let heap_used_mb = to_mb(usage.heap_used);
        Self {
            heap_used_mb,
            heap_total_mb: to_mb(usage.heap_total),
            external_mb: to_mb(usage.external),
            rss_mb: to_mb(usage.rss),
            should_reclaim: heap_used_mb > gc_threshold_mb as f64,
        }
    }
}

/// Watches process memory against a threshold and advises reclamation.
///
/// The advisor holds no state beyond its configuration, the probe and an
/// optional reclaim hook. Probe failures read as an all-zero sample, which
/// never advises reclamation.
pub struct MemoryAdvisor {
    config: MemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    reclaim_hook: Option<ReclaimHook>,
    reclaims: AtomicU64,
}

impl MemoryAdvisor {
    /// Advisor over the current process.
    pub fn new(config: MemoryConfig) -> anyhow::Result<Self> {
        Ok(Self::with_probe(config, Arc::new(ProcessMemoryProbe::new()?)))
    }

    pub fn with_probe(config: MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            reclaim_hook: None,
            reclaims: AtomicU64::new(0),
        }
    }

    /// Install the hook `optimize` fires when `force_gc` is on.
    pub fn with_reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.reclaim_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Whether heap usage is strictly above `gc_threshold_mb`.
    pub fn should_reclaim(&self) -> bool {
        self.get_memory_stats().should_reclaim
    }

    pub fn get_memory_stats(&self) -> MemorySample {
        let usage = match self.probe.sample() {
            Ok(usage) => usage,
            Err(err) => {
                warn!(error = %err, "memory probe failed, reporting zero usage");
                MemoryUsage::default()
            }
        };
        MemorySample::from_usage(usage, self.config.gc_threshold_mb)
    }

    /// Run the reclaim hook if reclamation is advised and allowed.
    ///
    /// Returns whether the hook ran. Cheap to call speculatively.
    pub fn optimize(&self) -> bool {
        let sample = self.get_memory_stats();
        self.reclaim_if_advised(&sample)
    }

    /// Sample every `interval` and reclaim under pressure.
    ///
    /// Each call starts its own timer.
    pub fn monitor_memory(self: &Arc<Self>, interval: Duration) -> PeriodicHandle {
        let advisor = Arc::clone(self);
        spawn_periodic("memory-monitor", interval, move || {
            let advisor = Arc::clone(&advisor);
            async move {
                let sample = advisor.get_memory_stats();
                debug!(
                    heap_used_mb = sample.heap_used_mb,
                    rss_mb = sample.rss_mb,
                    should_reclaim = sample.should_reclaim,
                    "memory sample"
                );
                if sample.should_reclaim {
                    advisor.reclaim_if_advised(&sample);
                }
            }
        })
    }

    /// Heap usage relative to `max_heap_size_mb`, if one is configured.
    pub fn pressure_ratio(&self) -> Option<f64> {
        let max = self.config.max_heap_size_mb.filter(|max| *max > 0)?;
        Some(self.get_memory_stats().heap_used_mb / max as f64)
    }

    /// Number of times the reclaim hook has run.
    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    fn reclaim_if_advised(&self, sample: &MemorySample) -> bool {
        if !sample.should_reclaim || !self.config.force_gc {
            return false;
        }
        let Some(hook) = self.reclaim_hook.as_ref() else {
            return false;
        };

        info!(
            heap_used_mb = sample.heap_used_mb,
            gc_threshold_mb = self.config.gc_threshold_mb,
            "memory above threshold, reclaiming"
        );
        hook();
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl fmt::Debug for MemoryAdvisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAdvisor")
            .field("config", &self.config)
            .field("probe", &self.probe)
            .field("reclaim_hook", &self.reclaim_hook.is_some())
            .finish()
    }
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct FixedProbe(u64);

    impl MemoryProbe for FixedProbe {
        fn sample(&self) -> anyhow::Result<MemoryUsage> {
            let bytes = self.0 * 1024 * 1024;
            Ok(MemoryUsage {
                heap_used: bytes,
                heap_total: bytes * 2,
                external: 0,
                rss: bytes,
            })
        }
    }

    #[derive(Debug)]
    struct BrokenProbe;

    impl MemoryProbe for BrokenProbe {
        fn sample(&self) -> anyhow::Result<MemoryUsage> {
            anyhow::bail!("no procfs")
        }
    }

    fn advisor(heap_mb: u64, config: MemoryConfig) -> MemoryAdvisor {
        MemoryAdvisor::with_probe(config, Arc::new(FixedProbe(heap_mb)))
    }

    fn counting_hook() -> (ReclaimHook, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: ReclaimHook = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (hook, calls)
    }

    #[test]
    fn test_threshold_is_strict() {
        let config = MemoryConfig::default();
        assert!(!advisor(511, config.clone()).should_reclaim());
        assert!(!advisor(512, config.clone()).should_reclaim());
        assert!(advisor(513, config).should_reclaim());
    }

    #[test]
    fn test_sample_is_reported_in_mb() {
        let sample = advisor(100, MemoryConfig::default()).get_memory_stats();
        assert_eq!(sample.heap_used_mb, 100.0);
        assert_eq!(sample.heap_total_mb, 200.0);
        assert_eq!(sample.external_mb, 0.0);
        assert!(!sample.should_reclaim);
    }

    #[test]
    fn test_optimize_requires_force_gc_and_hook() {
        let (hook, calls) = counting_hook();

        // Advised but not allowed
        let passive = advisor(1024, MemoryConfig::default()).with_reclaim_hook(hook.clone());
        assert!(!passive.optimize());

        // Allowed but no hook
        let config = MemoryConfig {
            force_gc: true,
            ..Default::default()
        };
        assert!(!advisor(1024, config.clone()).optimize());

        // Allowed with hook but below threshold
        let idle = advisor(64, config.clone()).with_reclaim_hook(hook.clone());
        assert!(!idle.optimize());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let active = advisor(1024, config).with_reclaim_hook(hook);
        assert!(active.optimize());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(active.reclaim_count(), 1);
    }

    #[test]
    fn test_broken_probe_degrades_to_zero() {
        let (hook, calls) = counting_hook();
        let config = MemoryConfig {
            gc_threshold_mb: 0,
            force_gc: true,
            ..Default::default()
        };
        let advisor = MemoryAdvisor::with_probe(config, Arc::new(BrokenProbe)).with_reclaim_hook(hook);

        assert_eq!(advisor.get_memory_stats(), MemorySample::default());
        assert!(!advisor.should_reclaim());
        assert!(!advisor.optimize());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pressure_ratio() {
        assert_eq!(advisor(256, MemoryConfig::default()).pressure_ratio(), None);

        let config = MemoryConfig {
            max_heap_size_mb: Some(1024),
            ..Default::default()
        };
        assert_eq!(advisor(256, config).pressure_ratio(), Some(0.25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reclaims_on_each_tick() {
        let (hook, calls) = counting_hook();
        let config = MemoryConfig {
            force_gc: true,
            ..Default::default()
        };
        let advisor = Arc::new(advisor(2048, config).with_reclaim_hook(hook));

        let handle = advisor.monitor_memory(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
