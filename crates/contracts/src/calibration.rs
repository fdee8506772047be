//! Calibration contracts - ground-truth checks with physically observable triggers
//!
//! All times are controller-clock seconds unless noted otherwise.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::DeviceId;

/// Observable stimulus used for a calibration event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationEventKind {
    LightPulse,
    AudioTone,
    #[default]
    TimestampMarker,
}

/// A trigger fired at a recorded reference time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEvent {
    pub event_id: String,
    pub kind: CalibrationEventKind,
    /// Controller time the stimulus was emitted
    pub reference_timestamp: f64,
    pub target_devices: BTreeSet<DeviceId>,
}

/// What a device reports after detecting a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDetection {
    pub device_id: DeviceId,
    pub event_id: String,
    /// Detection time on the device clock
    pub detected_timestamp: f64,
    /// Detector confidence 0-1
    pub confidence: f64,
}

/// A detection mapped into the controller timebase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMeasurement {
    pub device_id: DeviceId,
    pub event_id: String,
    pub reference_timestamp: f64,
    /// As reported, device clock
    pub detected_timestamp: f64,
    /// RTT-based offset estimate subtracted from `detected_timestamp`
    pub applied_offset: f64,
    pub confidence: f64,
}

impl CalibrationMeasurement {
    pub fn corrected_timestamp(&self) -> f64 {
        self.detected_timestamp - self.applied_offset
    }

    /// Detected (controller timebase) minus reference
    pub fn detection_delay(&self) -> f64 {
        self.corrected_timestamp() - self.reference_timestamp
    }
}

/// One trigger and the detections it produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationEventResult {
    pub event: CalibrationEvent,
    pub measurements: Vec<CalibrationMeasurement>,
    /// Devices that replied but fell below the confidence threshold
    #[serde(default)]
    pub rejected: Vec<DeviceId>,
}

impl CalibrationEventResult {
    /// max(detection delay) - min(detection delay); `None` without responses
    pub fn sync_error(&self) -> Option<f64> {
        let mut delays = self.measurements.iter().map(|m| m.detection_delay());
        let first = delays.next()?;
        let (min, max) = delays.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(max - min)
    }

    pub fn response_count(&self) -> usize {
        self.measurements.len()
    }
}

/// Parameters of a calibration session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationPlan {
    pub num_events: usize,
    /// Spacing between triggers (seconds)
    pub interval_seconds: f64,
    pub kind: CalibrationEventKind,
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self {
            num_events: 10,
            interval_seconds: 1.0,
            kind: CalibrationEventKind::TimestampMarker,
        }
    }
}

/// A sequence of calibration events against one device set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSession {
    pub session_id: String,
    pub plan: CalibrationPlan,
    pub devices: BTreeSet<DeviceId>,
    pub started_at: f64,
    pub finished_at: Option<f64>,
    pub events: Vec<CalibrationEventResult>,
}

/// Overall verdict of a calibration analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationAssessment {
    Excellent,
    Good,
    Fair,
    Poor,
    InsufficientData,
}

impl CalibrationAssessment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::InsufficientData => "insufficient_data",
        }
    }
}

impl fmt::Display for CalibrationAssessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-device calibration breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCalibrationStats {
    pub device_id: DeviceId,
    pub responses: usize,
    /// Mean detection delay (seconds)
    pub average_delay: f64,
    /// Population variance of the detection delay (seconds²)
    pub delay_variance: f64,
    pub response_rate: f64,
    pub average_confidence: f64,
    /// RTT-based uncertainty at analysis time, if known
    pub rtt_uncertainty: Option<f64>,
}

/// Result of analyzing a calibration session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationAnalysis {
    pub session_id: String,
    pub assessment: CalibrationAssessment,
    pub total_events: usize,
    /// Events with at least one accepted detection
    pub responsive_events: usize,
    pub mean_error: Option<f64>,
    pub max_error: Option<f64>,
    pub p95_error: Option<f64>,
    pub mean_confidence: Option<f64>,
    pub devices: BTreeMap<DeviceId, DeviceCalibrationStats>,
    pub recommendations: Vec<String>,
}
