//! Controller clock abstraction.

use std::sync::Arc;

/// Source of controller time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;

    /// Current time as epoch milliseconds (wire format)
    fn now_ms(&self) -> f64 {
        self.now() * 1000.0
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock, seconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Monotonic clock driven by `tokio::time`.
///
/// Starts at `epoch` and advances with the tokio timer, so it follows
/// paused/advanced time in tests.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
    epoch: f64,
}

impl MonotonicClock {
    pub fn new(epoch: f64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            epoch,
        }
    }

    /// Anchored at the current wall-clock time
    pub fn from_system() -> Self {
        Self::new(SystemClock.now())
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.epoch + self.origin.elapsed().as_secs_f64()
    }
}
