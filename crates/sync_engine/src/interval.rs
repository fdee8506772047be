//! Adaptive resync interval.
//!
//! Stable links are probed less often, noisy or failing links more often.

use std::time::Duration;

const GROWTH: f64 = 1.2;
const SHRINK: f64 = 0.8;
const FAILURE_SHRINK: f64 = 0.5;
const MAX_FACTOR: f64 = 3.0;
const MIN_FACTOR: f64 = 0.3;
const HIGH_QUALITY: f64 = 0.9;
const LOW_QUALITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveInterval {
    base: f64,
    current: f64,
    failure_floor: f64,
}

impl AdaptiveInterval {
    pub fn new(base: Duration, failure_floor: Duration) -> Self {
        let base = base.as_secs_f64();
        Self {
            base,
            current: base,
            failure_floor: failure_floor.as_secs_f64(),
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs_f64(self.current)
    }

    pub fn base(&self) -> Duration {
        Duration::from_secs_f64(self.base)
    }

    /// Adjust after an accepted estimate of the given quality
    pub fn on_success(&mut self, quality: f64) {
        if quality > HIGH_QUALITY {
            self.current = (self.current * GROWTH).min(self.base * MAX_FACTOR);
        } else if quality < LOW_QUALITY {
            self.current = (self.current * SHRINK).max(self.base * MIN_FACTOR);
        }
    }

    /// Adjust after a failed attempt; never lengthens the interval
    pub fn on_failure(&mut self) {
        let floor = self.failure_floor.min(self.current);
        self.current = (self.current * FAILURE_SHRINK).max(floor);
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
