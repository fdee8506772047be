//! Engine and controller configuration contracts.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::CalibrationEventKind;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Tuning of the synchronization engine.
///
/// Every field has a default, so a config file only lists what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Measurement window per device (FIFO)
    #[validate(range(min = 1))]
    pub max_measurements: usize,
    /// Base interval between automatic resyncs
    #[validate(range(min = 0.1))]
    pub sync_interval_seconds: f64,
    /// Measurements that must survive outlier filtering
    #[validate(range(min = 1))]
    pub min_measurements: usize,
    /// Uncertainty ceiling for an accepted estimate
    #[validate(range(min = 0.0))]
    pub max_uncertainty_seconds: f64,
    /// Outlier threshold in standard deviations
    #[validate(range(min = 0.1))]
    pub outlier_stddev_multiplier: f64,
    #[validate(range(min = 0.1))]
    pub heartbeat_interval_seconds: f64,
    /// How long a calibration trigger waits for detections
    #[validate(range(min = 0.01))]
    pub detection_timeout_seconds: f64,
    /// Detections below this confidence are discarded
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_confidence_threshold: f64,

    /// Probes per sync batch
    #[validate(range(min = 1))]
    pub probes_per_sync: usize,
    pub probe_spacing_ms: u64,
    #[validate(range(min = 0.001))]
    pub probe_timeout_seconds: f64,
    /// RTT at which probe quality reaches zero
    #[validate(range(min = 0.001))]
    pub max_acceptable_rtt_seconds: f64,
    /// Recovery attempts before giving up on a device
    #[validate(range(min = 1))]
    pub max_recovery_attempts: u32,
    #[validate(range(min = 0.1))]
    pub max_backoff_seconds: f64,
    /// Symmetric jitter applied to backoff delays (0.1 = ±10%)
    #[validate(range(min = 0.0, max = 1.0))]
    pub backoff_jitter_ratio: f64,
    /// Floor of the adaptive interval while a device is failing
    #[validate(range(min = 0.1))]
    pub min_resync_interval_seconds: f64,
    #[validate(range(min = 1))]
    pub event_history_size: usize,
    #[validate(range(min = 0.01))]
    pub default_event_timeout_seconds: f64,
    #[validate(range(min = 1))]
    pub calibration_history_size: usize,
    /// Seed for jitter and simulation noise; random when unset
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_measurements: 100,
            sync_interval_seconds: 30.0,
            min_measurements: 3,
            max_uncertainty_seconds: 0.05,
            outlier_stddev_multiplier: 3.0,
            heartbeat_interval_seconds: 10.0,
            detection_timeout_seconds: 2.0,
            min_confidence_threshold: 0.7,
            probes_per_sync: 5,
            probe_spacing_ms: 10,
            probe_timeout_seconds: 1.0,
            max_acceptable_rtt_seconds: 0.1,
            max_recovery_attempts: 5,
            max_backoff_seconds: 60.0,
            backoff_jitter_ratio: 0.1,
            min_resync_interval_seconds: 5.0,
            event_history_size: 100,
            default_event_timeout_seconds: 5.0,
            calibration_history_size: 20,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sync_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_seconds)
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.detection_timeout_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_seconds)
    }

    pub fn probe_spacing(&self) -> Duration {
        Duration::from_millis(self.probe_spacing_ms)
    }

    pub fn default_event_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_event_timeout_seconds)
    }
}

/// Complete controller configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ControllerBlueprint {
    #[serde(default)]
    pub version: ConfigVersion,

    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineConfig,

    #[serde(default)]
    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub groups: Vec<GroupConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub calibration: CalibrationSettings,

    #[serde(default)]
    pub observability: ObservabilitySettings,
}

/// A device known to the controller
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeviceConfig {
    #[validate(length(min = 1))]
    pub id: String,

    /// Behaviour of the simulated stand-in (simulated transport only)
    #[serde(default)]
    #[validate(nested)]
    pub simulation: SimulationProfile,
}

/// Behaviour of a simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SimulationProfile {
    /// True device clock minus controller clock
    pub clock_offset_ms: f64,
    /// Mean one-way network latency
    #[validate(range(min = 0.0))]
    pub latency_ms: f64,
    /// Uniform ± jitter on each one-way leg
    #[validate(range(min = 0.0))]
    pub latency_jitter_ms: f64,
    /// Probability a probe or event is lost
    #[validate(range(min = 0.0, max = 1.0))]
    pub drop_rate: f64,
    /// Time the device takes to handle an event
    #[validate(range(min = 0.0))]
    pub processing_delay_ms: f64,
    /// Latency of the device's trigger detector
    #[validate(range(min = 0.0))]
    pub detection_latency_ms: f64,
    #[validate(range(min = 0.0))]
    pub detection_jitter_ms: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub detection_confidence: f64,
    pub online: bool,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            clock_offset_ms: 0.0,
            latency_ms: 5.0,
            latency_jitter_ms: 1.0,
            drop_rate: 0.0,
            processing_delay_ms: 2.0,
            detection_latency_ms: 3.0,
            detection_jitter_ms: 1.0,
            detection_confidence: 0.95,
            online: true,
        }
    }
}

/// A named set of devices synchronized together
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GroupConfig {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub devices: Vec<String>,
}

/// Calibration defaults for the CLI
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CalibrationSettings {
    #[validate(range(min = 1))]
    pub num_events: usize,
    #[validate(range(min = 0.0))]
    pub interval_seconds: f64,
    pub kind: CalibrationEventKind,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            num_events: 10,
            interval_seconds: 1.0,
            kind: CalibrationEventKind::TimestampMarker,
        }
    }
}

/// Logging / metrics settings read by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
        }
    }
}
