//! Event coordinator - timed broadcast/collect of coordination events
//!
//! A broadcast registers the event as active, runs local handlers, fans the
//! send out to every target concurrently and waits until the full quorum has
//! answered or the timeout elapses. The resolved status then moves from the
//! active map into a bounded history exactly once.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use contracts::{
    Clock, DeviceEventResponse, DeviceId, DeviceTransport, EngineConfig, EventPayload,
    EventPriority, SharedClock, SyncEvent, SyncEventKind, SyncEventStatus,
};
use ringbuf::{traits::*, HeapRb};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use sync_engine::TimeSyncEngine;

use crate::error::CoordinationError;
use crate::lock;

/// Source identity stamped on events this controller emits
pub const CONTROLLER_SOURCE: &str = "controller";

/// Local callback run for every event before fan-out
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&SyncEvent) + Send + Sync,
{
    fn on_event(&self, event: &SyncEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Aggregate view over the event history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStatistics {
    pub total_events: usize,
    pub active_events: usize,
    pub successful_events: usize,
    pub timed_out_events: usize,
    pub success_rate: f64,
    pub average_quality: f64,
    pub average_response_rate: f64,
}

struct ActiveEvent {
    status: SyncEventStatus,
    /// Fired once the quorum is complete
    completed: CancellationToken,
    /// Fired by `cancel_event` or shutdown
    cancel: CancellationToken,
}

struct BackgroundTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    Complete,
    Deadline,
    Cancelled,
}

struct Inner<T> {
    transport: Arc<T>,
    clock: SharedClock,
    /// Receives send failures so the device lifecycle sees them
    engine: Option<TimeSyncEngine<T>>,
    default_timeout: Duration,
    heartbeat_interval: Duration,
    handlers: Mutex<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    next_handler: AtomicU64,
    active: Mutex<HashMap<String, ActiveEvent>>,
    history: Mutex<HeapRb<SyncEventStatus>>,
    heartbeat: Mutex<Option<BackgroundTask>>,
    shutdown: CancellationToken,
}

/// Broadcasts coordination events and collects acknowledgements.
///
/// Cheap to clone; clones share state.
pub struct EventCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> EventCoordinator<T>
where
    T: DeviceTransport + Sync + 'static,
{
    /// Standalone coordinator; send failures are only logged.
    pub fn new(transport: Arc<T>, clock: SharedClock, config: &EngineConfig) -> Self {
        Self::build(transport, clock, config, None)
    }

    /// Coordinator sharing the engine's transport and clock.
    ///
    /// A failed event send is reported to the engine, moving the device to
    /// NETWORK_ERROR and scheduling recovery.
    pub fn for_engine(engine: &TimeSyncEngine<T>) -> Self {
        Self::build(
            Arc::clone(engine.transport()),
            engine.clock().clone(),
            engine.config(),
            Some(engine.clone()),
        )
    }

    fn build(
        transport: Arc<T>,
        clock: SharedClock,
        config: &EngineConfig,
        engine: Option<TimeSyncEngine<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                clock,
                engine,
                default_timeout: config.default_event_timeout(),
                heartbeat_interval: config.heartbeat_interval(),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
                active: Mutex::new(HashMap::new()),
                history: Mutex::new(HeapRb::new(config.event_history_size.max(1))),
                heartbeat: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.handlers).push((id, handler));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Broadcast an event and wait for the quorum or the timeout.
    ///
    /// Returns the event id once the wait has resolved. `timeout` defaults to
    /// `default_event_timeout_seconds`.
    pub async fn broadcast(
        &self,
        kind: SyncEventKind,
        payload: EventPayload,
        priority: EventPriority,
        targets: &[DeviceId],
        timeout: Option<Duration>,
    ) -> Result<String, CoordinationError> {
        let event = self.build_event(kind, payload, priority, String::new());
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        self.dispatch(event, targets, timeout, None).await
    }

    pub async fn broadcast_recording_start(
        &self,
        targets: &[DeviceId],
        session_name: Option<&str>,
    ) -> Result<String, CoordinationError> {
        let mut payload = EventPayload::new();
        if let Some(name) = session_name {
            payload.insert("session_name".into(), name.into());
        }
        let event = self.build_event(
            SyncEventKind::RecordingStart,
            payload,
            EventPriority::High,
            "Start recording".into(),
        );
        self.dispatch(event, targets, self.inner.default_timeout, None)
            .await
    }

    pub async fn broadcast_recording_stop(
        &self,
        targets: &[DeviceId],
    ) -> Result<String, CoordinationError> {
        let event = self.build_event(
            SyncEventKind::RecordingStop,
            EventPayload::new(),
            EventPriority::High,
            "Stop recording".into(),
        );
        self.dispatch(event, targets, self.inner.default_timeout, None)
            .await
    }

    pub async fn broadcast_sync_marker(
        &self,
        targets: &[DeviceId],
        label: &str,
    ) -> Result<String, CoordinationError> {
        let mut payload = EventPayload::new();
        payload.insert("marker".into(), label.into());
        let event = self.build_event(
            SyncEventKind::SyncMarker,
            payload,
            EventPriority::Normal,
            format!("Sync marker {label}"),
        );
        self.dispatch(event, targets, self.inner.default_timeout, None)
            .await
    }

    /// Record a response delivered outside the broadcast's own send path.
    ///
    /// Returns false for unknown or finished events and for responses the
    /// status ignores.
    pub fn record_response(&self, response: DeviceEventResponse) -> bool {
        let mut active = lock(&self.inner.active);
        let Some(entry) = active.get_mut(&response.event_id) else {
            return false;
        };
        let recorded = entry.status.record_response(response);
        if recorded && entry.status.is_complete() {
            entry.completed.cancel();
        }
        recorded
    }

    /// Stop waiting on an active event; it still moves to history.
    pub fn cancel_event(&self, event_id: &str) -> bool {
        match lock(&self.inner.active).get(event_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_events(&self) -> Vec<SyncEventStatus> {
        lock(&self.inner.active)
            .values()
            .map(|entry| entry.status.clone())
            .collect()
    }

    /// Resolved events, oldest first
    pub fn event_history(&self) -> Vec<SyncEventStatus> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    pub fn event_status(&self, event_id: &str) -> Option<SyncEventStatus> {
        if let Some(entry) = lock(&self.inner.active).get(event_id) {
            return Some(entry.status.clone());
        }
        lock(&self.inner.history)
            .iter()
            .find(|status| status.event_id() == event_id)
            .cloned()
    }

    pub fn statistics(&self) -> EventStatistics {
        let active_events = lock(&self.inner.active).len();
        let history = lock(&self.inner.history);

        let total_events = history.occupied_len();
        if total_events == 0 {
            return EventStatistics {
                active_events,
                ..Default::default()
            };
        }

        let mut stats = EventStatistics {
            total_events,
            active_events,
            ..Default::default()
        };
        let mut quality_sum = 0.0;
        let mut rate_sum = 0.0;
        for status in history.iter() {
            if status.is_successful() {
                stats.successful_events += 1;
            }
            if status.timed_out {
                stats.timed_out_events += 1;
            }
            quality_sum += status.quality();
            rate_sum += status.response_rate();
        }
        let n = total_events as f64;
        stats.success_rate = stats.successful_events as f64 / n;
        stats.average_quality = quality_sum / n;
        stats.average_response_rate = rate_sum / n;
        stats
    }

    /// Start the periodic low-priority heartbeat; false if already running.
    pub fn start_heartbeat(&self, targets: Vec<DeviceId>) -> bool {
        let mut slot = lock(&self.inner.heartbeat);
        if slot.as_ref().is_some_and(|hb| !hb.task.is_finished()) {
            return false;
        }
        let stop = self.inner.shutdown.child_token();
        let task = tokio::spawn(self.clone().heartbeat_loop(targets, stop.clone()));
        *slot = Some(BackgroundTask { stop, task });
        info!(
            interval_s = self.inner.heartbeat_interval.as_secs_f64(),
            "Heartbeat started"
        );
        true
    }

    /// Stop the heartbeat and wait for its loop to exit
    pub async fn stop_heartbeat(&self) -> bool {
        let running = lock(&self.inner.heartbeat).take();
        match running {
            Some(hb) => {
                hb.stop.cancel();
                if let Err(e) = hb.task.await {
                    warn!(error = %e, "heartbeat task ended abnormally");
                }
                info!("Heartbeat stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_heartbeat_running(&self) -> bool {
        lock(&self.inner.heartbeat)
            .as_ref()
            .is_some_and(|hb| !hb.task.is_finished())
    }

    /// Cancel every active wait and stop the heartbeat
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop_heartbeat().await;
    }

    fn build_event(
        &self,
        kind: SyncEventKind,
        payload: EventPayload,
        priority: EventPriority,
        description: String,
    ) -> SyncEvent {
        SyncEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: kind,
            timestamp: self.inner.clock.now_ms(),
            priority,
            data: payload,
            description,
            source_device: CONTROLLER_SOURCE.to_string(),
        }
    }

    fn notify_handlers(&self, event: &SyncEvent) {
        let handlers: Vec<_> = lock(&self.inner.handlers)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler.on_event(event);
        }
    }

    #[instrument(
        name = "event_broadcast",
        skip(self, event, targets, stop),
        fields(event_id = %event.event_id, kind = %event.event_type, targets = targets.len())
    )]
    async fn dispatch(
        &self,
        event: SyncEvent,
        targets: &[DeviceId],
        timeout: Duration,
        stop: Option<&CancellationToken>,
    ) -> Result<String, CoordinationError> {
        let target_set: BTreeSet<DeviceId> = targets.iter().cloned().collect();
        if target_set.is_empty() {
            return Err(CoordinationError::NoTargets);
        }

        let event_id = event.event_id.clone();
        let completed = CancellationToken::new();
        let cancel = self.inner.shutdown.child_token();
        let status = SyncEventStatus::new(event.clone(), event.timestamp, target_set.clone(), timeout);
        lock(&self.inner.active).insert(
            event_id.clone(),
            ActiveEvent {
                status,
                completed: completed.clone(),
                cancel: cancel.clone(),
            },
        );
        let _active = ActiveGuard {
            inner: Arc::clone(&self.inner),
            event_id: event_id.clone(),
        };

        self.notify_handlers(&event);

        let event = Arc::new(event);
        let mut sends = JoinSet::new();
        for device_id in target_set {
            let transport = Arc::clone(&self.inner.transport);
            let event = Arc::clone(&event);
            sends.spawn(async move {
                let result = transport.send_event(&device_id, &event, timeout).await;
                (device_id, result)
            });
        }

        let stop = stop.cloned().unwrap_or_default();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut sends_done = false;

        let end = loop {
            tokio::select! {
                _ = completed.cancelled() => break WaitEnd::Complete,
                _ = cancel.cancelled() => break WaitEnd::Cancelled,
                _ = stop.cancelled() => break WaitEnd::Cancelled,
                _ = &mut deadline => break WaitEnd::Deadline,
                joined = sends.join_next(), if !sends_done => match joined {
                    Some(Ok((_, Ok(response)))) => {
                        self.record_response(response);
                    }
                    Some(Ok((device_id, Err(e)))) => {
                        debug!(device_id = %device_id, error = %e, "event send failed");
                        if let Some(engine) = &self.inner.engine {
                            engine.report_transport_failure(&device_id, &e);
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "event send task failed"),
                    None => sends_done = true,
                },
            }
        };

        // No send may outlive the wait
        sends.shutdown().await;
        self.inner.finish(&event_id, end);
        Ok(event_id)
    }

    async fn heartbeat_loop(self, targets: Vec<DeviceId>, stop: CancellationToken) {
        let period = self.inner.heartbeat_interval;
        let timeout = self.inner.default_timeout.min(period);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let event = self.build_event(
                SyncEventKind::Heartbeat,
                EventPayload::new(),
                EventPriority::Low,
                "Heartbeat".into(),
            );
            if let Err(e) = self.dispatch(event, &targets, timeout, Some(&stop)).await {
                warn!(error = %e, "heartbeat broadcast failed");
            }
        }
    }
}

impl<T> Inner<T> {
    /// Move an event from active to history; a no-op once it has moved
    fn finish(&self, event_id: &str, end: WaitEnd) {
        let Some(entry) = lock(&self.active).remove(event_id) else {
            return;
        };
        let mut status = entry.status;
        status.resolved_at = Some(self.clock.now_ms());
        status.timed_out = end == WaitEnd::Deadline && !status.is_complete();

        match end {
            WaitEnd::Complete | WaitEnd::Deadline if status.is_successful() => info!(
                event_id,
                kind = %status.event.event_type,
                quality = status.quality(),
                "Event acknowledged by all targets"
            ),
            WaitEnd::Cancelled => info!(
                event_id,
                responses = status.responses.len(),
                "Event wait cancelled"
            ),
            _ => warn!(
                event_id,
                kind = %status.event.event_type,
                response_rate = status.response_rate(),
                missing = ?status.missing_devices(),
                timed_out = status.timed_out,
                "Event resolved without full acknowledgement"
            ),
        }
        observability::record_event_broadcast(&status);

        lock(&self.history).push_overwrite(status);
    }
}

/// Resolves the active entry as cancelled if the broadcast future is dropped
/// before it finishes waiting.
struct ActiveGuard<T> {
    inner: Arc<Inner<T>>,
    event_id: String,
}

impl<T> Drop for ActiveGuard<T> {
    fn drop(&mut self) {
        self.inner.finish(&self.event_id, WaitEnd::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{MonotonicClock, ResponseStatus, SimulationProfile, SyncState};
    use std::sync::atomic::AtomicUsize;
    use transport::SimulatedTransport;

    fn quiet_profile() -> SimulationProfile {
        SimulationProfile {
            latency_ms: 5.0,
            latency_jitter_ms: 0.0,
            ..Default::default()
        }
    }

    fn setup(
        devices: &[&str],
        config: EngineConfig,
    ) -> (EventCoordinator<SimulatedTransport>, Arc<SimulatedTransport>, Vec<DeviceId>) {
        let clock: SharedClock = Arc::new(MonotonicClock::new(1_000.0));
        let transport = Arc::new(SimulatedTransport::new(clock.clone(), Some(3)));
        for id in devices {
            transport.add_device(*id, quiet_profile());
        }
        let coordinator = EventCoordinator::new(transport.clone(), clock, &config);
        let ids = devices.iter().map(|id| DeviceId::from(*id)).collect();
        (coordinator, transport, ids)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_quorum_resolves_early() {
        let (coordinator, _, ids) = setup(&["a", "b", "c"], EngineConfig::default());

        let started = tokio::time::Instant::now();
        let event_id = coordinator
            .broadcast(
                SyncEventKind::SyncMarker,
                EventPayload::new(),
                EventPriority::Normal,
                &ids,
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        let status = coordinator.event_status(&event_id).unwrap();
        assert!(status.is_complete());
        assert!(status.is_successful());
        assert!(!status.timed_out);
        assert!(coordinator.active_events().is_empty());
        assert_eq!(coordinator.event_history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_partial_status_kept() {
        let (coordinator, transport, ids) = setup(&["a", "b", "c"], EngineConfig::default());
        transport.set_respond_to_events("c", false);

        let started = tokio::time::Instant::now();
        let event_id = coordinator
            .broadcast(
                SyncEventKind::SyncMarker,
                EventPayload::new(),
                EventPriority::Normal,
                &ids,
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        let history = coordinator.event_history();
        assert_eq!(history.len(), 1);
        let status = &history[0];
        assert_eq!(status.event_id(), event_id);
        assert_eq!(status.responses.len(), 2);
        assert!((status.response_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!(!status.is_complete());
        assert!(!status.is_successful());
        assert!(status.timed_out);
        assert_eq!(status.missing_devices(), vec![DeviceId::from("c")]);
        assert!(coordinator.active_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_reaches_engine() {
        let clock: SharedClock = Arc::new(MonotonicClock::new(1_000.0));
        let transport = Arc::new(SimulatedTransport::new(clock.clone(), Some(3)));
        transport.add_device("a", quiet_profile());
        transport.add_device("b", quiet_profile());
        let engine = TimeSyncEngine::new(transport.clone(), clock, EngineConfig::default());
        engine.register_device("a");
        engine.register_device("b");
        engine.sync_device("a", None).await.unwrap();
        engine.sync_device("b", None).await.unwrap();
        let coordinator = EventCoordinator::for_engine(&engine);

        transport.set_online("a", false);
        let ids = vec![DeviceId::from("a"), DeviceId::from("b")];
        let event_id = coordinator
            .broadcast(
                SyncEventKind::SyncMarker,
                EventPayload::new(),
                EventPriority::Normal,
                &ids,
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        let status = coordinator.event_status(&event_id).unwrap();
        assert_eq!(status.responses.len(), 1);
        assert_eq!(status.missing_devices(), vec![DeviceId::from("a")]);
        assert_eq!(
            engine.get_sync_status("a").unwrap().state,
            SyncState::NetworkError
        );
        assert!(engine.failure_info("a").is_some());
        assert!(engine.is_synchronized("b"));

        coordinator.shutdown().await;
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_send_failure_only_logged() {
        let (coordinator, transport, ids) = setup(&["a"], EngineConfig::default());
        transport.set_online("a", false);

        let event_id = coordinator
            .broadcast_sync_marker(&ids, "offline")
            .await
            .unwrap();

        let status = coordinator.event_status(&event_id).unwrap();
        assert!(status.responses.is_empty());
        assert!(status.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_broadcast_moves_event_to_history() {
        let (coordinator, transport, ids) = setup(&["a"], EngineConfig::default());
        transport.set_respond_to_events("a", false);

        let waited = tokio::time::timeout(
            Duration::from_millis(500),
            coordinator.broadcast(
                SyncEventKind::SyncMarker,
                EventPayload::new(),
                EventPriority::Normal,
                &ids,
                Some(Duration::from_secs(5)),
            ),
        )
        .await;
        assert!(waited.is_err());

        assert!(coordinator.active_events().is_empty());
        let history = coordinator.event_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolved_at.is_some());
        assert!(!history[0].timed_out);

        // Nothing left to resolve it later
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(coordinator.event_history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejecting_device_is_not_successful() {
        let (coordinator, transport, ids) = setup(&["a", "b"], EngineConfig::default());
        transport.set_reject_events("b", true);

        let event_id = coordinator.broadcast_recording_stop(&ids).await.unwrap();

        let status = coordinator.event_status(&event_id).unwrap();
        assert!(status.is_complete());
        assert!(!status.is_successful());
        assert_eq!(
            status.responses[&DeviceId::from("b")].status,
            ResponseStatus::Error
        );
        assert_eq!(status.event.priority, EventPriority::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let config = EngineConfig {
            event_history_size: 3,
            ..Default::default()
        };
        let (coordinator, _, ids) = setup(&["a"], config);

        let mut event_ids = Vec::new();
        for i in 0..5 {
            let id = coordinator
                .broadcast_sync_marker(&ids, &format!("m{i}"))
                .await
                .unwrap();
            event_ids.push(id);
        }

        let history: Vec<String> = coordinator
            .event_history()
            .iter()
            .map(|s| s.event_id().to_string())
            .collect();
        assert_eq!(history, event_ids[2..].to_vec());
        assert_eq!(coordinator.statistics().total_events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_targets_rejected() {
        let (coordinator, _, _) = setup(&[], EngineConfig::default());
        let err = coordinator
            .broadcast(
                SyncEventKind::Custom,
                EventPayload::new(),
                EventPriority::Low,
                &[],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NoTargets));
        assert!(coordinator.event_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_run_before_fan_out() {
        let (coordinator, transport, ids) = setup(&["a"], EngineConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));

        let devices = Arc::clone(&transport);
        let counter = Arc::clone(&seen);
        let id = coordinator.add_handler(Arc::new(move |event: &SyncEvent| {
            assert_eq!(event.event_type, SyncEventKind::RecordingStart);
            assert_eq!(devices.events_received("a"), 0);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let event_id = coordinator
            .broadcast_recording_start(&ids, Some("take-1"))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let status = coordinator.event_status(&event_id).unwrap();
        assert_eq!(status.event.data["session_name"], "take-1");

        assert!(coordinator.remove_handler(id));
        coordinator.broadcast_recording_stop(&ids).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_band_response_completes_quorum() {
        let (coordinator, transport, ids) = setup(&["a"], EngineConfig::default());
        transport.set_respond_to_events("a", false);

        let responder = coordinator.clone();
        coordinator.add_handler(Arc::new(move |event: &SyncEvent| {
            let responder = responder.clone();
            let event_id = event.event_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                responder.record_response(DeviceEventResponse {
                    device_id: "a".into(),
                    event_id,
                    received_timestamp: 0.0,
                    processed_timestamp: 1.0,
                    local_timestamp: 1.0,
                    status: ResponseStatus::Acknowledged,
                    error_message: None,
                });
            });
        }));

        let started = tokio::time::Instant::now();
        let event_id = coordinator.broadcast_sync_marker(&ids, "late").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(coordinator.event_status(&event_id).unwrap().is_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_active_wait() {
        let (coordinator, transport, ids) = setup(&["a"], EngineConfig::default());
        transport.set_respond_to_events("a", false);

        let waiter = coordinator.clone();
        let wait = tokio::spawn(async move {
            waiter
                .broadcast(
                    SyncEventKind::Custom,
                    EventPayload::new(),
                    EventPriority::Normal,
                    &ids,
                    Some(Duration::from_secs(30)),
                )
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coordinator.active_events().len(), 1);

        coordinator.shutdown().await;
        let event_id = wait.await.unwrap().unwrap();

        let status = coordinator.event_status(&event_id).unwrap();
        assert!(!status.timed_out);
        assert!(status.responses.is_empty());
        assert!(coordinator.active_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_broadcasts_periodically() {
        let config = EngineConfig {
            heartbeat_interval_seconds: 2.0,
            ..Default::default()
        };
        let (coordinator, _, ids) = setup(&["a", "b"], config);

        assert!(coordinator.start_heartbeat(ids.clone()));
        assert!(!coordinator.start_heartbeat(ids));
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert!(coordinator.stop_heartbeat().await);
        assert!(!coordinator.is_heartbeat_running());

        let history = coordinator.event_history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|s| {
            s.event.event_type == SyncEventKind::Heartbeat
                && s.event.priority == EventPriority::Low
                && s.event.data.is_empty()
                && s.is_successful()
        }));
    }
}
