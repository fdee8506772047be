//! TimeSyncMeasurement - one probe round trip
//!
//! Two-timestamp model: the controller stamps send and receive, the device
//! stamps once in between. Network delay is assumed symmetric.

use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Result of a single synchronization probe.
///
/// All times are seconds. `send_time`/`receive_time` are controller clock,
/// `device_time` is the device clock reading carried by the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncMeasurement {
    pub device_id: DeviceId,
    pub send_time: f64,
    pub device_time: f64,
    pub receive_time: f64,
    pub round_trip_time: f64,
    /// Device clock minus controller clock
    pub offset: f64,
    pub one_way_delay: f64,
    /// 1.0 for an instantaneous round trip, 0.0 at or above the acceptable RTT
    pub quality: f64,
}

impl TimeSyncMeasurement {
    /// Derive offset, delay and quality from the three probe timestamps.
    pub fn from_probe(
        device_id: DeviceId,
        send_time: f64,
        device_time: f64,
        receive_time: f64,
        max_acceptable_rtt: f64,
    ) -> Self {
        let round_trip_time = (receive_time - send_time).max(0.0);
        let one_way_delay = round_trip_time / 2.0;
        let device_time_at_send = device_time - one_way_delay;
        let offset = device_time_at_send - send_time;

        Self {
            device_id,
            send_time,
            device_time,
            receive_time,
            round_trip_time,
            offset,
            one_way_delay,
            quality: rtt_quality(round_trip_time, max_acceptable_rtt),
        }
    }

    /// Offset in milliseconds
    pub fn offset_ms(&self) -> f64 {
        self.offset * 1000.0
    }
}

/// Linear quality ramp: 1.0 at zero RTT, 0.0 at `max_acceptable_rtt` and above.
pub fn rtt_quality(round_trip_time: f64, max_acceptable_rtt: f64) -> f64 {
    if max_acceptable_rtt <= 0.0 || round_trip_time >= max_acceptable_rtt {
        return 0.0;
    }
    (1.0 - round_trip_time / max_acceptable_rtt).clamp(0.0, 1.0)
}
