//! DeviceTransport trait - the engine's only way to reach a device
//!
//! The physical transport (UDP discovery, TCP command channel, ...) lives
//! outside this workspace; the engine consumes it through this trait.

use std::time::Duration;

use crate::{
    CalibrationDetection, CalibrationEvent, DeviceEventResponse, DeviceId, SyncEvent,
    TransportError,
};

/// Device communication trait
///
/// Implementations must be cheap to share: the engine holds one behind an
/// `Arc` and calls it from many concurrent tasks.
#[trait_variant::make(DeviceTransport: Send)]
pub trait LocalDeviceTransport {
    /// Send a synchronization probe and return the device clock reading
    /// (seconds) carried by the reply.
    async fn send_probe(&self, device_id: &DeviceId) -> Result<f64, TransportError>;

    /// Deliver an event and wait up to `timeout` for the device's acknowledgement.
    async fn send_event(
        &self,
        device_id: &DeviceId,
        event: &SyncEvent,
        timeout: Duration,
    ) -> Result<DeviceEventResponse, TransportError>;

    /// Ask a device to report its detection of a calibration trigger.
    async fn request_detection(
        &self,
        device_id: &DeviceId,
        event: &CalibrationEvent,
        timeout: Duration,
    ) -> Result<CalibrationDetection, TransportError>;
}
