//! Calibration engine - fires triggers and collects detections
//!
//! Detections are mapped into the controller timebase with the sync
//! engine's current offset, so the measured error is what the RTT model
//! leaves behind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use contracts::{
    CalibrationAnalysis, CalibrationDetection, CalibrationEvent, CalibrationEventKind,
    CalibrationEventResult, CalibrationMeasurement, CalibrationPlan, CalibrationSession, Clock,
    DeviceId, DeviceTransport, TransportError,
};
use ringbuf::{traits::*, HeapRb};
use sync_engine::TimeSyncEngine;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::analysis::analyze_session;
use crate::error::CalibrationError;

/// Events fired by a quick check
pub const QUICK_CHECK_EVENTS: usize = 3;
/// Spacing of quick-check triggers (seconds)
pub const QUICK_CHECK_INTERVAL_S: f64 = 0.5;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CalibrationEngine<T> {
    engine: TimeSyncEngine<T>,
    detection_timeout: Duration,
    min_confidence: f64,
    history: Mutex<HeapRb<CalibrationSession>>,
}

impl<T> CalibrationEngine<T>
where
    T: DeviceTransport + Sync + 'static,
{
    pub fn new(engine: TimeSyncEngine<T>) -> Self {
        let config = engine.config();
        let detection_timeout = config.detection_timeout();
        let min_confidence = config.min_confidence_threshold;
        let capacity = config.calibration_history_size.max(1);
        Self {
            engine,
            detection_timeout,
            min_confidence,
            history: Mutex::new(HeapRb::new(capacity)),
        }
    }

    /// Fire `plan.num_events` triggers `plan.interval_seconds` apart.
    #[instrument(
        name = "calibration_session",
        skip(self, devices, plan),
        fields(devices = devices.len(), events = plan.num_events, kind = ?plan.kind)
    )]
    pub async fn start_calibration_session(
        &self,
        devices: &[DeviceId],
        plan: CalibrationPlan,
    ) -> Result<CalibrationSession, CalibrationError> {
        let devices = self.check_devices(devices)?;
        if plan.num_events == 0 {
            return Err(CalibrationError::InvalidPlan(
                "num_events must be at least 1".into(),
            ));
        }
        let interval = Duration::try_from_secs_f64(plan.interval_seconds)
            .map_err(|e| CalibrationError::InvalidPlan(format!("interval_seconds: {e}")))?;

        let clock = self.engine.clock();
        let mut session = CalibrationSession {
            session_id: Uuid::new_v4().to_string(),
            plan,
            devices,
            started_at: clock.now(),
            finished_at: None,
            events: Vec::new(),
        };
        info!(session_id = %session.session_id, "Calibration session started");

        for index in 0..session.plan.num_events {
            if index > 0 {
                tokio::time::sleep(interval).await;
            }
            let result = self.fire_event(session.plan.kind, &session.devices).await;
            observability::record_calibration_event(result.sync_error(), result.response_count());
            session.events.push(result);
        }
        session.finished_at = Some(clock.now());

        let responses: usize = session.events.iter().map(|e| e.response_count()).sum();
        info!(
            session_id = %session.session_id,
            events = session.events.len(),
            responses,
            "Calibration session finished"
        );
        lock(&self.history).push_overwrite(session.clone());
        Ok(session)
    }

    /// Three timestamp markers in quick succession, analyzed immediately
    pub async fn run_quick_calibration_check(
        &self,
        devices: &[DeviceId],
    ) -> Result<CalibrationAnalysis, CalibrationError> {
        let plan = CalibrationPlan {
            num_events: QUICK_CHECK_EVENTS,
            interval_seconds: QUICK_CHECK_INTERVAL_S,
            kind: CalibrationEventKind::TimestampMarker,
        };
        let session = self.start_calibration_session(devices, plan).await?;
        Ok(self.analyze_calibration_results(&session))
    }

    /// Analyze a session against the engine's current RTT uncertainties
    pub fn analyze_calibration_results(&self, session: &CalibrationSession) -> CalibrationAnalysis {
        let uncertainties: BTreeMap<DeviceId, f64> = session
            .devices
            .iter()
            .filter_map(|id| {
                let status = self.engine.get_sync_status(id)?;
                Some((id.clone(), status.uncertainty?))
            })
            .collect();

        let analysis = analyze_session(session, &uncertainties);
        observability::record_calibration_session(
            analysis.assessment.as_str(),
            analysis.mean_error,
        );
        info!(
            session_id = %analysis.session_id,
            assessment = %analysis.assessment,
            mean_error_ms = analysis.mean_error.map(|e| e * 1000.0),
            "Calibration analyzed"
        );
        analysis
    }

    /// Past sessions, oldest first
    pub fn session_history(&self) -> Vec<CalibrationSession> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn latest_session(&self) -> Option<CalibrationSession> {
        lock(&self.history).iter().last().cloned()
    }

    fn check_devices(&self, devices: &[DeviceId]) -> Result<BTreeSet<DeviceId>, CalibrationError> {
        let devices: BTreeSet<DeviceId> = devices.iter().cloned().collect();
        if devices.is_empty() {
            return Err(CalibrationError::NoDevices);
        }
        let registered: BTreeSet<DeviceId> = self.engine.registered_devices().into_iter().collect();
        if let Some(unknown) = devices.difference(&registered).next() {
            return Err(CalibrationError::UnknownDevice(unknown.clone()));
        }
        Ok(devices)
    }

    #[instrument(name = "calibration_event", skip(self, devices), fields(kind = ?kind))]
    async fn fire_event(
        &self,
        kind: CalibrationEventKind,
        devices: &BTreeSet<DeviceId>,
    ) -> CalibrationEventResult {
        let event = Arc::new(CalibrationEvent {
            event_id: Uuid::new_v4().to_string(),
            kind,
            reference_timestamp: self.engine.clock().now(),
            target_devices: devices.clone(),
        });

        let timeout = self.detection_timeout;
        let mut requests = JoinSet::new();
        for device_id in devices.iter().cloned() {
            let transport = Arc::clone(self.engine.transport());
            let event = Arc::clone(&event);
            requests.spawn(async move {
                let result = tokio::time::timeout(
                    timeout,
                    transport.request_detection(&device_id, &event, timeout),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::timeout(format!(
                        "detection from '{device_id}' timed out"
                    )))
                });
                (device_id, result)
            });
        }

        let mut measurements = Vec::new();
        let mut rejected = Vec::new();
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((device_id, Ok(detection))) => {
                    match self.to_measurement(&event, &device_id, detection) {
                        Some(m) if m.confidence >= self.min_confidence => measurements.push(m),
                        Some(m) => {
                            debug!(device_id = %device_id, confidence = m.confidence, "low-confidence detection discarded");
                            rejected.push(device_id);
                        }
                        None => warn!(device_id = %device_id, "detection for another trigger ignored"),
                    }
                }
                Ok((device_id, Err(e))) => {
                    debug!(device_id = %device_id, error = %e, "no detection");
                }
                Err(e) => warn!(error = %e, "detection task failed"),
            }
        }
        measurements.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        rejected.sort();

        CalibrationEventResult {
            event: Arc::unwrap_or_clone(event),
            measurements,
            rejected,
        }
    }

    fn to_measurement(
        &self,
        event: &CalibrationEvent,
        device_id: &DeviceId,
        detection: CalibrationDetection,
    ) -> Option<CalibrationMeasurement> {
        if detection.event_id != event.event_id || detection.device_id != *device_id {
            return None;
        }
        let applied_offset = self.engine.device_offset(device_id).unwrap_or(0.0);
        Some(CalibrationMeasurement {
            device_id: detection.device_id,
            event_id: detection.event_id,
            reference_timestamp: event.reference_timestamp,
            detected_timestamp: detection.detected_timestamp,
            applied_offset,
            confidence: detection.confidence,
        })
    }
}
