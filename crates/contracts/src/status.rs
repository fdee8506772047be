//! DeviceSyncStatus - per-device synchronization lifecycle record

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::{DeviceId, TimeSyncMeasurement};

/// Synchronization lifecycle state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Registered, never synchronized
    Idle,
    /// Probe batch in flight
    Syncing,
    /// Last batch produced an accepted estimate
    Synchronized,
    /// Last batch was rejected by the estimator
    Error,
    /// Transport failure, recovery may be pending
    NetworkError,
    /// Recovery probe in flight
    Recovering,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Synchronized => "synchronized",
            Self::Error => "error",
            Self::NetworkError => "network_error",
            Self::Recovering => "recovering",
        }
    }

    /// States in which a probe is outstanding for the device
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Syncing | Self::Recovering)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Error | Self::NetworkError)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronization status of a registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSyncStatus {
    pub device_id: DeviceId,
    pub state: SyncState,
    /// Estimated device clock minus controller clock (seconds)
    pub offset: Option<f64>,
    /// Error bound of `offset` (seconds)
    pub uncertainty: Option<f64>,
    /// Controller time of the last accepted estimate
    pub last_sync_time: Option<f64>,
    /// Recent measurements, oldest first
    pub measurements: VecDeque<TimeSyncMeasurement>,
    pub sync_attempts: u64,
    pub sync_successes: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    max_measurements: usize,
    max_uncertainty: f64,
}

impl DeviceSyncStatus {
    pub fn new(device_id: DeviceId, max_measurements: usize, max_uncertainty: f64) -> Self {
        let max_measurements = max_measurements.max(1);
        Self {
            device_id,
            state: SyncState::Idle,
            offset: None,
            uncertainty: None,
            last_sync_time: None,
            measurements: VecDeque::with_capacity(max_measurements),
            sync_attempts: 0,
            sync_successes: 0,
            consecutive_failures: 0,
            last_error: None,
            max_measurements,
            max_uncertainty,
        }
    }

    /// Append a measurement, evicting the oldest when the window is full
    pub fn record_measurement(&mut self, measurement: TimeSyncMeasurement) {
        while self.measurements.len() >= self.max_measurements {
            self.measurements.pop_front();
        }
        self.measurements.push_back(measurement);
    }

    pub fn max_measurements(&self) -> usize {
        self.max_measurements
    }

    pub fn max_uncertainty(&self) -> f64 {
        self.max_uncertainty
    }

    /// SYNCHRONIZED with an uncertainty within the ceiling
    pub fn is_synchronized(&self) -> bool {
        self.state == SyncState::Synchronized
            && self
                .uncertainty
                .is_some_and(|u| u <= self.max_uncertainty)
    }

    /// 0-1 score derived from uncertainty; `None` unless synchronized
    pub fn sync_quality(&self) -> Option<f64> {
        if !self.is_synchronized() {
            return None;
        }
        let uncertainty = self.uncertainty?;
        if self.max_uncertainty <= 0.0 {
            return Some(0.0);
        }
        Some((1.0 - uncertainty / self.max_uncertainty).clamp(0.0, 1.0))
    }

    /// Fraction of sync attempts that produced an accepted estimate
    pub fn success_rate(&self) -> f64 {
        if self.sync_attempts == 0 {
            0.0
        } else {
            self.sync_successes as f64 / self.sync_attempts as f64
        }
    }

    /// Mean per-probe quality over the measurement window
    pub fn average_measurement_quality(&self) -> Option<f64> {
        if self.measurements.is_empty() {
            return None;
        }
        let total: f64 = self.measurements.iter().map(|m| m.quality).sum();
        Some(total / self.measurements.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(offset: f64) -> TimeSyncMeasurement {
        TimeSyncMeasurement::from_probe("d".into(), 0.0, offset + 0.005, 0.010, 0.1)
    }

    #[test]
    fn test_fresh_device_not_synchronized() {
        let status = DeviceSyncStatus::new("d".into(), 10, 0.05);
        assert_eq!(status.state, SyncState::Idle);
        assert!(!status.is_synchronized());
        assert_eq!(status.sync_quality(), None);
    }

    #[test]
    fn test_synchronized_requires_uncertainty_within_ceiling() {
        let mut status = DeviceSyncStatus::new("d".into(), 10, 0.05);
        status.state = SyncState::Synchronized;
        assert!(!status.is_synchronized(), "no uncertainty yet");

        status.uncertainty = Some(0.06);
        assert!(!status.is_synchronized());

        status.uncertainty = Some(0.01);
        assert!(status.is_synchronized());
        assert!((status.sync_quality().unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_measurement_window_evicts_oldest() {
        let mut status = DeviceSyncStatus::new("d".into(), 3, 0.05);
        for i in 0..5 {
            status.record_measurement(measurement(i as f64));
        }
        assert_eq!(status.measurements.len(), 3);
        let offsets: Vec<f64> = status.measurements.iter().map(|m| m.offset.round()).collect();
        assert_eq!(offsets, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_success_rate() {
        let mut status = DeviceSyncStatus::new("d".into(), 3, 0.05);
        assert_eq!(status.success_rate(), 0.0);
        status.sync_attempts = 4;
        status.sync_successes = 3;
        assert!((status.success_rate() - 0.75).abs() < 1e-9);
    }
}
