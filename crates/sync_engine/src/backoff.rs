//! Exponential recovery backoff with seedable jitter.

use std::sync::Mutex;
use std::time::Duration;

use contracts::EngineConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::registry::lock;

#[derive(Debug)]
pub struct BackoffPolicy {
    max_delay_seconds: f64,
    jitter_ratio: f64,
    rng: Mutex<StdRng>,
}

impl BackoffPolicy {
    pub fn new(max_delay_seconds: f64, jitter_ratio: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            max_delay_seconds,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_backoff_seconds,
            config.backoff_jitter_ratio,
            config.rng_seed,
        )
    }

    /// min(2^retry_count, cap) seconds, before jitter
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let exponential = (1_u64 << retry_count.min(20)) as f64;
        Duration::from_secs_f64(exponential.min(self.max_delay_seconds))
    }

    /// Base delay scaled by a uniform factor in [1 - jitter, 1 + jitter]
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let base = self.base_delay(retry_count).as_secs_f64();
        let factor = if self.jitter_ratio > 0.0 {
            1.0 + lock(&self.rng).random_range(-self.jitter_ratio..=self.jitter_ratio)
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles_then_caps() {
        let policy = BackoffPolicy::new(60.0, 0.1, Some(1));
        let secs: Vec<f64> = (0..8).map(|r| policy.base_delay(r).as_secs_f64()).collect();
        assert_eq!(secs, vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 60.0, 60.0]);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = BackoffPolicy::new(60.0, 0.1, Some(9));
        for retry in 0..6 {
            let base = policy.base_delay(retry).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(retry).as_secs_f64();
                assert!(delay >= base * 0.9 - 1e-9 && delay <= base * 1.1 + 1e-9);
            }
        }
    }

    #[test]
    fn test_consecutive_delays_non_decreasing_until_cap() {
        let policy = BackoffPolicy::new(60.0, 0.1, Some(3));
        let delays: Vec<Duration> = (0..7).map(|r| policy.delay_for_attempt(r)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
    }

    #[test]
    fn test_seeded_policies_agree() {
        let a = BackoffPolicy::new(60.0, 0.25, Some(77));
        let b = BackoffPolicy::new(60.0, 0.25, Some(77));
        for retry in 0..5 {
            assert_eq!(a.delay_for_attempt(retry), b.delay_for_attempt(retry));
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = BackoffPolicy::new(10.0, 0.0, None);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(10));
    }
}
