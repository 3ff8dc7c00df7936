use batchcore::memory::{MemoryAdvisor, MemoryConfig, MemoryProbe, MemoryUsage, ReclaimHook};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Probe whose reading can be changed from the test.
#[derive(Debug, Default)]
struct SimulatedProbe {
    heap_used: AtomicU64,
}

impl SimulatedProbe {
    fn set_mb(&self, mb: u64) {
        self.heap_used.store(mb * MB, Ordering::SeqCst);
    }
}

impl MemoryProbe for SimulatedProbe {
    fn sample(&self) -> anyhow::Result<MemoryUsage> {
        let heap_used = self.heap_used.load(Ordering::SeqCst);
        Ok(MemoryUsage {
            heap_used,
            heap_total: heap_used + 64 * MB,
            external: 0,
            rss: heap_used + 16 * MB,
        })
    }
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
fn test_should_reclaim_boundary() {
    let probe = Arc::new(SimulatedProbe::default());
    let advisor = MemoryAdvisor::with_probe(MemoryConfig::default(), probe.clone());

    probe.set_mb(300);
    assert!(!advisor.should_reclaim());

    probe.set_mb(512);
    assert!(!advisor.should_reclaim());

    probe.set_mb(513);
    assert!(advisor.should_reclaim());

    let sample = advisor.get_memory_stats();
    assert_eq!(sample.heap_used_mb, 513.0);
    assert_eq!(sample.rss_mb, 529.0);
    assert!(sample.should_reclaim);
}

#[test]
fn test_optimize_only_acts_when_allowed() {
    let probe = Arc::new(SimulatedProbe::default());
    let (hook, calls) = counting_hook();
    probe.set_mb(900);

    let advisory_only = MemoryAdvisor::with_probe(MemoryConfig::default(), probe.clone())
        .with_reclaim_hook(hook.clone());
    assert!(!advisory_only.optimize());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let forcing = MemoryAdvisor::with_probe(
        MemoryConfig {
            force_gc: true,
            ..Default::default()
        },
        probe.clone(),
    )
    .with_reclaim_hook(hook);
    assert!(forcing.optimize());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    probe.set_mb(100);
    assert!(!forcing.optimize());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_follows_pressure_and_stops_on_cancel() {
    let probe = Arc::new(SimulatedProbe::default());
    let (hook, calls) = counting_hook();
    let advisor = Arc::new(
        MemoryAdvisor::with_probe(
            MemoryConfig {
                gc_threshold_mb: 256,
                force_gc: true,
                max_heap_size_mb: Some(1024),
            },
            probe.clone(),
        )
        .with_reclaim_hook(hook),
    );

    probe.set_mb(128);
    let handle = advisor.monitor_memory(Duration::from_millis(50));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    probe.set_mb(512);
    assert_eq!(advisor.pressure_ratio(), Some(0.5));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handle.cancel();
    handle.cancel();
    assert!(!handle.is_active());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(advisor.reclaim_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_each_monitor_call_owns_its_timer() {
    let probe = Arc::new(SimulatedProbe::default());
    let (hook, calls) = counting_hook();
    probe.set_mb(2048);
    let advisor = Arc::new(
        MemoryAdvisor::with_probe(
            MemoryConfig {
                force_gc: true,
                ..Default::default()
            },
            probe,
        )
        .with_reclaim_hook(hook),
    );

    let first = advisor.monitor_memory(Duration::from_millis(100));
    let second = advisor.monitor_memory(Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    first.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(second.is_active());

    second.cancel();
}
