//! Network failure bookkeeping shared by the engine and its observers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DeviceId;

/// Failure classification reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No reply within the allotted time
    Timeout,
    /// Device actively refused the connection
    ConnectionRefused,
    /// Device could not be reached at all
    Unreachable,
    /// Reply could not be interpreted
    Protocol,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::Unreachable => "unreachable",
            Self::Protocol => "protocol",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery state of a device that hit a transport failure.
///
/// Created on the first detected failure, removed when the device recovers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFailureInfo {
    pub device_id: DeviceId,
    /// Controller time (seconds) of the first failure in this streak
    pub first_failure_time: f64,
    pub kind: FailureKind,
    /// Number of recovery attempts already made
    pub retry_count: u32,
    pub last_retry_time: Option<f64>,
    /// Set once automatic recovery has given up
    pub exhausted: bool,
}

impl NetworkFailureInfo {
    pub fn new(device_id: DeviceId, kind: FailureKind, now: f64) -> Self {
        Self {
            device_id,
            first_failure_time: now,
            kind,
            retry_count: 0,
            last_retry_time: None,
            exhausted: false,
        }
    }

    /// Record a failed recovery attempt
    pub fn record_retry(&mut self, kind: FailureKind, now: f64) {
        self.kind = kind;
        self.retry_count += 1;
        self.last_retry_time = Some(now);
    }

    /// Seconds since the first failure of this streak
    pub fn outage_duration(&self, now: f64) -> f64 {
        (now - self.first_failure_time).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_retry_updates_kind_and_count() {
        let mut info = NetworkFailureInfo::new("d1".into(), FailureKind::Timeout, 10.0);
        info.record_retry(FailureKind::Unreachable, 12.0);
        info.record_retry(FailureKind::Unreachable, 15.0);

        assert_eq!(info.retry_count, 2);
        assert_eq!(info.kind, FailureKind::Unreachable);
        assert_eq!(info.last_retry_time, Some(15.0));
        assert!((info.outage_duration(20.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_kind_wire_names() {
        let json = serde_json::to_string(&FailureKind::ConnectionRefused).unwrap();
        assert_eq!(json, "\"connection_refused\"");
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
    }
}
