//! Fixed-cadence fallback polling.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Cadence used once a probe has declared push dead.
pub const POLL_INTERVAL_DEGRADED: Duration = Duration::from_secs(3);

/// Cadence for a background safety-net refresh.
pub const POLL_INTERVAL_SAFETY_NET: Duration = Duration::from_secs(10);

/// Whether the consumer is visible and focused right now.
pub type ActiveCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Work run on each active tick.
pub type Tick = Arc<dyn Fn() + Send + Sync>;

/// Periodic timer that only fires its tick while the consumer is active.
///
/// Inactive ticks are skipped, not deferred. Requires a Tokio runtime.
pub struct FallbackPoller {
    runtime: Option<Handle>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackPoller {
    /// Poller spawning onto the runtime current at `start`.
    pub fn new() -> Self {
        Self {
            runtime: None,
            task: Mutex::new(None),
        }
    }

    /// Poller spawning onto `runtime`, so `start` may be called from threads
    /// outside it (e.g. a channel provider's callback thread).
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            task: Mutex::new(None),
        }
    }

    /// Start polling, replacing any running timer.
    ///
    /// The first tick fires one `interval` after start.
    pub fn start(&self, interval: Duration, active_check: ActiveCheck, tick: Tick) {
        let polling = async move {
            let mut timer = interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if active_check() {
                    tick();
                } else {
                    tracing::trace!("consumer inactive, skipping poll");
                }
            }
        };
        let handle = match &self.runtime {
            Some(runtime) => runtime.spawn(polling),
            None => tokio::spawn(polling),
        };

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        tracing::debug!(interval_ms = interval.as_millis() as u64, "fallback poller started");
    }

    /// Cancel the timer. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            tracing::debug!("fallback poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Default for FallbackPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Tick) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let tick: Tick = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, tick)
    }

    fn always() -> ActiveCheck {
        Arc::new(|| true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_cadence() {
        let poller = FallbackPoller::new();
        let (count, tick) = counter();
        poller.start(POLL_INTERVAL_DEGRADED, always(), tick);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(POLL_INTERVAL_DEGRADED * 2).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_ticks_skipped() {
        let poller = FallbackPoller::new();
        let (count, tick) = counter();
        let active = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&active);
        poller.start(Duration::from_secs(1), Arc::new(move || flag.load(Ordering::SeqCst)), tick);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(poller.is_running());

        active.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let poller = FallbackPoller::new();
        let (count, tick) = counter();
        poller.start(Duration::from_secs(1), always(), tick);

        poller.stop();
        poller.stop();
        assert!(!poller.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_from_foreign_thread() {
        let poller = Arc::new(FallbackPoller::with_runtime(Handle::current()));
        let (count, tick) = counter();
        let remote = Arc::clone(&poller);
        std::thread::spawn(move || remote.start(Duration::from_secs(1), always(), tick))
            .join()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_timer() {
        let poller = FallbackPoller::new();
        let (count, tick) = counter();
        poller.start(Duration::from_secs(1), always(), Arc::clone(&tick));
        poller.start(Duration::from_secs(1), always(), tick);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
