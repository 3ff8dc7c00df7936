use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Handle to a background timer started with [`spawn_periodic`].
///
/// Dropping the handle does not stop the timer; call [`PeriodicHandle::cancel`].
#[must_use = "the timer keeps running until cancel() is called"]
#[derive(Debug)]
pub struct PeriodicHandle {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicHandle {
    /// Stop the timer. Safe to call any number of times.
    pub fn cancel(&self) {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
            debug!(timer = %self.name, "periodic timer cancelled");
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Run `tick` every `period`, first firing one full period after the call.
///
/// Must be called from within a tokio runtime. A zero period is raised to 1ms.
pub fn spawn_periodic<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> PeriodicHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let period = period.max(Duration::from_millis(1));

    debug!(timer = %name, period_ms = period.as_millis() as u64, "starting periodic timer");

    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            tick().await;
        }
    });

    PeriodicHandle {
        name,
        handle: Mutex::new(Some(handle)),
    }
}
