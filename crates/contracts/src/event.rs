//! Coordination events and their acknowledgements
//!
//! Wire form is a JSON-compatible map; timestamps are epoch milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use crate::DeviceId;

/// Processing delay at which the processing term of event quality reaches zero
pub const PROCESSING_DELAY_CEILING_MS: f64 = 100.0;

/// Kind of coordination event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    RecordingStart,
    RecordingStop,
    SyncMarker,
    CalibrationTrigger,
    Heartbeat,
    Custom,
}

impl SyncEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordingStart => "recording_start",
            Self::RecordingStop => "recording_stop",
            Self::SyncMarker => "sync_marker",
            Self::CalibrationTrigger => "calibration_trigger",
            Self::Heartbeat => "heartbeat",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event priority, serialized as an integer 1-4
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum EventPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl From<EventPriority> for u8 {
    fn from(priority: EventPriority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for EventPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            other => Err(format!("event priority must be 1-4, got {other}")),
        }
    }
}

/// Free-form event payload
pub type EventPayload = serde_json::Map<String, serde_json::Value>;

/// Timestamped coordination event broadcast to a device set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub event_type: SyncEventKind,
    /// Controller time of creation, epoch ms
    pub timestamp: f64,
    pub priority: EventPriority,
    #[serde(default)]
    pub data: EventPayload,
    #[serde(default)]
    pub description: String,
    pub source_device: String,
}

/// Acknowledgement status reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Acknowledged,
    Error,
}

/// A device's reply to a [`SyncEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEventResponse {
    pub device_id: DeviceId,
    pub event_id: String,
    /// Device clock at reception, epoch ms
    pub received_timestamp: f64,
    /// Device clock once handled, epoch ms
    pub processed_timestamp: f64,
    /// Device clock when the reply was sent, epoch ms
    pub local_timestamp: f64,
    pub status: ResponseStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DeviceEventResponse {
    pub fn processing_delay_ms(&self) -> f64 {
        (self.processed_timestamp - self.received_timestamp).max(0.0)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.status == ResponseStatus::Acknowledged
    }
}

/// Delivery state of one broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEventStatus {
    pub event: SyncEvent,
    /// Controller time the fan-out started, epoch ms
    pub send_time: f64,
    pub target_devices: BTreeSet<DeviceId>,
    pub responses: HashMap<DeviceId, DeviceEventResponse>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Controller time the wait resolved, epoch ms
    pub resolved_at: Option<f64>,
    pub timed_out: bool,
}

impl SyncEventStatus {
    pub fn new(
        event: SyncEvent,
        send_time: f64,
        target_devices: BTreeSet<DeviceId>,
        timeout: Duration,
    ) -> Self {
        Self {
            event,
            send_time,
            target_devices,
            responses: HashMap::new(),
            timeout,
            resolved_at: None,
            timed_out: false,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    /// Record a response. Responses for other events, from non-target
    /// devices, or repeated responses are ignored.
    pub fn record_response(&mut self, response: DeviceEventResponse) -> bool {
        if response.event_id != self.event.event_id
            || !self.target_devices.contains(&response.device_id)
            || self.responses.contains_key(&response.device_id)
        {
            return false;
        }
        self.responses.insert(response.device_id.clone(), response);
        true
    }

    /// Every target device has responded
    pub fn is_complete(&self) -> bool {
        self.responses.len() >= self.target_devices.len()
    }

    /// Wait condition: full quorum or timeout elapsed
    pub fn is_resolved(&self, now_ms: f64) -> bool {
        self.is_complete() || now_ms - self.send_time >= self.timeout.as_secs_f64() * 1000.0
    }

    pub fn response_rate(&self) -> f64 {
        if self.target_devices.is_empty() {
            return 0.0;
        }
        self.responses.len() as f64 / self.target_devices.len() as f64
    }

    pub fn max_processing_delay_ms(&self) -> Option<f64> {
        self.responses
            .values()
            .map(DeviceEventResponse::processing_delay_ms)
            .fold(None, |acc, d| Some(acc.map_or(d, |a: f64| a.max(d))))
    }

    /// (response_rate + max(0, 1 - max_processing_delay / 100ms)) / 2
    pub fn quality(&self) -> f64 {
        let processing_term = match self.max_processing_delay_ms() {
            Some(delay) => (1.0 - delay / PROCESSING_DELAY_CEILING_MS).max(0.0),
            None => 0.0,
        };
        (self.response_rate() + processing_term) / 2.0
    }

    /// Complete quorum and every response acknowledged
    pub fn is_successful(&self) -> bool {
        self.is_complete() && self.responses.values().all(DeviceEventResponse::is_acknowledged)
    }

    pub fn missing_devices(&self) -> Vec<DeviceId> {
        self.target_devices
            .iter()
            .filter(|id| !self.responses.contains_key(*id))
            .cloned()
            .collect()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> SyncEvent {
        SyncEvent {
            event_id: id.to_string(),
            event_type: SyncEventKind::SyncMarker,
            timestamp: 1_000.0,
            priority: EventPriority::High,
            data: EventPayload::new(),
            description: String::new(),
            source_device: "controller".to_string(),
        }
    }

    fn response(device: &str, event_id: &str, delay_ms: f64) -> DeviceEventResponse {
        DeviceEventResponse {
            device_id: device.into(),
            event_id: event_id.to_string(),
            received_timestamp: 1_010.0,
            processed_timestamp: 1_010.0 + delay_ms,
            local_timestamp: 1_010.0 + delay_ms,
            status: ResponseStatus::Acknowledged,
            error_message: None,
        }
    }

    fn status(targets: &[&str]) -> SyncEventStatus {
        SyncEventStatus::new(
            event("e1"),
            1_000.0,
            targets.iter().map(|t| DeviceId::from(*t)).collect(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_priority_wire_format() {
        let json = serde_json::to_value(event("e1")).unwrap();
        assert_eq!(json["priority"], 3);
        assert_eq!(json["event_type"], "sync_marker");

        let parsed: EventPriority = serde_json::from_str("4").unwrap();
        assert_eq!(parsed, EventPriority::Critical);
        assert!(serde_json::from_str::<EventPriority>("7").is_err());
    }

    #[test]
    fn test_response_status_wire_format() {
        let json = serde_json::to_value(response("a", "e1", 1.0)).unwrap();
        assert_eq!(json["status"], "acknowledged");
    }

    #[test]
    fn test_partial_quorum_scores() {
        let mut s = status(&["a", "b", "c"]);
        assert!(s.record_response(response("a", "e1", 10.0)));
        assert!(s.record_response(response("b", "e1", 20.0)));

        assert!(!s.is_complete());
        assert!(!s.is_successful());
        assert!((s.response_rate() - 2.0 / 3.0).abs() < 1e-9);
        // (0.667 + (1 - 20/100)) / 2
        assert!((s.quality() - (2.0 / 3.0 + 0.8) / 2.0).abs() < 1e-9);
        assert_eq!(s.missing_devices(), vec![DeviceId::from("c")]);
    }

    #[test]
    fn test_resolution_on_timeout() {
        let s = status(&["a"]);
        assert!(!s.is_resolved(5_999.0));
        assert!(s.is_resolved(6_000.0));
    }

    #[test]
    fn test_response_map_bounded_by_targets() {
        let mut s = status(&["a", "b"]);
        assert!(s.record_response(response("a", "e1", 1.0)));
        assert!(!s.record_response(response("a", "e1", 1.0)), "duplicate");
        assert!(!s.record_response(response("z", "e1", 1.0)), "not a target");
        assert!(!s.record_response(response("b", "other", 1.0)), "wrong event");
        assert_eq!(s.responses.len(), 1);
    }

    #[test]
    fn test_error_response_not_successful() {
        let mut s = status(&["a"]);
        let mut r = response("a", "e1", 1.0);
        r.status = ResponseStatus::Error;
        r.error_message = Some("camera busy".into());
        s.record_response(r);
        assert!(s.is_complete());
        assert!(!s.is_successful());
    }

    #[test]
    fn test_slow_processing_clamps_to_zero() {
        let mut s = status(&["a"]);
        s.record_response(response("a", "e1", 250.0));
        assert!((s.quality() - 0.5).abs() < 1e-9);
    }
}
