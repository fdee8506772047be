//! 模拟设备传输层
//!
//! 无真实设备时使用，支持注入离线、丢包、拒绝事件等失败场景。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use contracts::{
    CalibrationDetection, CalibrationEvent, DeviceEventResponse, DeviceId, DeviceTransport,
    ResponseStatus, SharedClock, SimulationProfile, SyncEvent, TransportError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{instrument, trace};

/// How long a lost probe takes to surface as a timeout
const LOST_PROBE_WAIT: Duration = Duration::from_secs(1);

/// Runtime state of one simulated device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub profile: SimulationProfile,
    /// Reply to events at all
    pub respond_to_events: bool,
    /// Reply to events with an error status
    pub reject_events: bool,
    /// Reply to calibration triggers
    pub respond_to_triggers: bool,
    probes_received: u64,
    events_received: u64,
}

impl SimulatedDevice {
    pub fn new(profile: SimulationProfile) -> Self {
        Self {
            profile,
            respond_to_events: true,
            reject_events: false,
            respond_to_triggers: true,
            probes_received: 0,
            events_received: 0,
        }
    }
}

/// Aggregate transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub probes_sent: u64,
    pub probes_failed: u64,
    pub events_sent: u64,
    pub events_failed: u64,
    pub detections_requested: u64,
}

/// Per-call latency plan sampled under the lock
#[derive(Debug, Clone, Copy)]
struct LegPlan {
    uplink: Duration,
    downlink: Duration,
    offset: f64,
    lost: bool,
}

/// In-process fleet of simulated devices
pub struct SimulatedTransport {
    clock: SharedClock,
    devices: Mutex<HashMap<DeviceId, SimulatedDevice>>,
    rng: Mutex<StdRng>,
    stats: Mutex<TransportStats>,
}

impl SimulatedTransport {
    /// Create an empty fleet; `seed` makes every sampled delay reproducible
    pub fn new(clock: SharedClock, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            clock,
            devices: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            stats: Mutex::new(TransportStats::default()),
        }
    }

    /// Add or replace a device
    pub fn add_device(&self, device_id: impl Into<DeviceId>, profile: SimulationProfile) {
        self.devices()
            .insert(device_id.into(), SimulatedDevice::new(profile));
    }

    pub fn remove_device(&self, device_id: &str) -> bool {
        self.devices().remove(device_id).is_some()
    }

    pub fn set_online(&self, device_id: &str, online: bool) {
        self.update(device_id, |d| d.profile.online = online);
    }

    pub fn set_clock_offset_ms(&self, device_id: &str, offset_ms: f64) {
        self.update(device_id, |d| d.profile.clock_offset_ms = offset_ms);
    }

    pub fn set_respond_to_events(&self, device_id: &str, respond: bool) {
        self.update(device_id, |d| d.respond_to_events = respond);
    }

    pub fn set_reject_events(&self, device_id: &str, reject: bool) {
        self.update(device_id, |d| d.reject_events = reject);
    }

    pub fn set_respond_to_triggers(&self, device_id: &str, respond: bool) {
        self.update(device_id, |d| d.respond_to_triggers = respond);
    }

    /// Snapshot of one device
    pub fn device(&self, device_id: &str) -> Option<SimulatedDevice> {
        self.devices().get(device_id).cloned()
    }

    /// Probes that reached the device (lost ones included)
    pub fn probes_received(&self, device_id: &str) -> u64 {
        self.devices()
            .get(device_id)
            .map(|d| d.probes_received)
            .unwrap_or(0)
    }

    pub fn events_received(&self, device_id: &str) -> u64 {
        self.devices()
            .get(device_id)
            .map(|d| d.events_received)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> TransportStats {
        *lock(&self.stats)
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<DeviceId, SimulatedDevice>> {
        lock(&self.devices)
    }

    fn update(&self, device_id: &str, f: impl FnOnce(&mut SimulatedDevice)) {
        if let Some(device) = self.devices().get_mut(device_id) {
            f(device);
        }
    }

    fn record(&self, f: impl FnOnce(&mut TransportStats)) {
        f(&mut lock(&self.stats));
    }

    /// Symmetric uniform jitter around `mean_ms`, never negative
    fn sample_ms(&self, mean_ms: f64, jitter_ms: f64) -> f64 {
        if jitter_ms <= 0.0 {
            return mean_ms.max(0.0);
        }
        let noise = lock(&self.rng).random_range(-jitter_ms..=jitter_ms);
        (mean_ms + noise).max(0.0)
    }

    fn sample_loss(&self, drop_rate: f64) -> bool {
        drop_rate > 0.0 && lock(&self.rng).random::<f64>() < drop_rate
    }

    /// Look up the device and sample both legs of one exchange
    fn plan_exchange(
        &self,
        device_id: &DeviceId,
        count: impl FnOnce(&mut SimulatedDevice),
    ) -> Result<(LegPlan, SimulatedDevice), TransportError> {
        let device = {
            let mut devices = self.devices();
            let device = devices.get_mut(device_id).ok_or_else(|| {
                TransportError::unreachable(format!("unknown device '{device_id}'"))
            })?;
            count(device);
            device.clone()
        };

        let profile = &device.profile;
        if !profile.online {
            return Err(TransportError::unreachable(format!(
                "device '{device_id}' is offline"
            )));
        }

        let plan = LegPlan {
            uplink: ms(self.sample_ms(profile.latency_ms, profile.latency_jitter_ms)),
            downlink: ms(self.sample_ms(profile.latency_ms, profile.latency_jitter_ms)),
            offset: profile.clock_offset_ms / 1000.0,
            lost: self.sample_loss(profile.drop_rate),
        };
        Ok((plan, device))
    }

    async fn exchange_event(
        &self,
        device_id: &DeviceId,
        event: &SyncEvent,
        plan: LegPlan,
        device: &SimulatedDevice,
    ) -> DeviceEventResponse {
        tokio::time::sleep(plan.uplink).await;
        let received = (self.clock.now() + plan.offset) * 1000.0;

        let processing = self.sample_ms(
            device.profile.processing_delay_ms,
            device.profile.processing_delay_ms * 0.1,
        );
        tokio::time::sleep(ms(processing)).await;
        let processed = (self.clock.now() + plan.offset) * 1000.0;

        let (status, error_message) = if device.reject_events {
            (
                ResponseStatus::Error,
                Some(format!("device rejected {}", event.event_type)),
            )
        } else {
            (ResponseStatus::Acknowledged, None)
        };

        tokio::time::sleep(plan.downlink).await;
        DeviceEventResponse {
            device_id: device_id.clone(),
            event_id: event.event_id.clone(),
            received_timestamp: received,
            processed_timestamp: processed,
            local_timestamp: processed,
            status,
            error_message,
        }
    }
}

impl DeviceTransport for SimulatedTransport {
    #[instrument(name = "simulated_send_probe", level = "trace", skip(self), fields(device_id = %device_id))]
    async fn send_probe(&self, device_id: &DeviceId) -> Result<f64, TransportError> {
        self.record(|s| s.probes_sent += 1);
        let plan = match self.plan_exchange(device_id, |d| d.probes_received += 1) {
            Ok((plan, _)) => plan,
            Err(e) => {
                self.record(|s| s.probes_failed += 1);
                return Err(e);
            }
        };

        if plan.lost {
            tokio::time::sleep(LOST_PROBE_WAIT).await;
            self.record(|s| s.probes_failed += 1);
            return Err(TransportError::timeout(format!(
                "probe to '{device_id}' lost"
            )));
        }

        tokio::time::sleep(plan.uplink).await;
        let device_time = self.clock.now() + plan.offset;
        tokio::time::sleep(plan.downlink).await;

        trace!(device_id = %device_id, device_time, "probe answered");
        Ok(device_time)
    }

    #[instrument(
        name = "simulated_send_event",
        level = "trace",
        skip(self, event),
        fields(device_id = %device_id, event_id = %event.event_id)
    )]
    async fn send_event(
        &self,
        device_id: &DeviceId,
        event: &SyncEvent,
        timeout: Duration,
    ) -> Result<DeviceEventResponse, TransportError> {
        self.record(|s| s.events_sent += 1);
        let (plan, device) = match self.plan_exchange(device_id, |d| d.events_received += 1) {
            Ok(found) => found,
            Err(e) => {
                self.record(|s| s.events_failed += 1);
                return Err(e);
            }
        };

        let answered = !plan.lost && device.respond_to_events;
        let result = if answered {
            tokio::time::timeout(timeout, self.exchange_event(device_id, event, plan, &device))
                .await
                .ok()
        } else {
            tokio::time::sleep(timeout).await;
            None
        };

        result.ok_or_else(|| {
            self.record(|s| s.events_failed += 1);
            TransportError::timeout(format!(
                "no acknowledgement from '{device_id}' within {:.3}s",
                timeout.as_secs_f64()
            ))
        })
    }

    #[instrument(
        name = "simulated_request_detection",
        level = "trace",
        skip(self, event),
        fields(device_id = %device_id, event_id = %event.event_id)
    )]
    async fn request_detection(
        &self,
        device_id: &DeviceId,
        event: &CalibrationEvent,
        timeout: Duration,
    ) -> Result<CalibrationDetection, TransportError> {
        self.record(|s| s.detections_requested += 1);
        let (plan, device) = self.plan_exchange(device_id, |_| {})?;
        let profile = &device.profile;

        if plan.lost || !device.respond_to_triggers {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::timeout(format!(
                "no detection from '{device_id}'"
            )));
        }

        let latency_s =
            self.sample_ms(profile.detection_latency_ms, profile.detection_jitter_ms) / 1000.0;
        let report_after = Duration::from_secs_f64(latency_s) + plan.downlink;
        if report_after > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::timeout(format!(
                "detection from '{device_id}' arrived after the deadline"
            )));
        }
        tokio::time::sleep(report_after).await;

        Ok(CalibrationDetection {
            device_id: device_id.clone(),
            event_id: event.event_id.clone(),
            detected_timestamp: event.reference_timestamp + latency_s + plan.offset,
            confidence: profile.detection_confidence,
        })
    }
}

fn ms(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0) / 1000.0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
