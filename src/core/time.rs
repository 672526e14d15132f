use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source for the message state core.
///
/// Inflight ages, idle windows, reaper eviction, and flush cadence all read
/// time through this trait rather than calling `Instant::now` directly:
/// tests steer `now` explicitly while the sleeps still ride the tokio timer
/// wheel (and fast-forward under paused test runtimes).
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;
}

/// Wall-clock time, used by the gateway and client runtimes.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

/// Test clock whose `now` only moves when advanced. Handles are clones, so
/// a test can hold one while the state service owns another.
#[derive(Clone)]
pub struct ManualClock {
    epoch: Instant,
    offset: Arc<parking_lot::Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            offset: Arc::new(parking_lot::Mutex::new(Duration::ZERO)),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}
