//! Time synchronization engine.
//!
//! Owns every registered device's status, runs probe batches through the
//! [`ClockEstimator`], drives the lifecycle state machine and the
//! backoff-driven recovery chain, and schedules automatic resyncs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use contracts::{
    DeviceId, DeviceSyncStatus, DeviceTransport, EngineConfig, NetworkFailureInfo, SharedClock,
    SyncError, SyncState, TimeSyncMeasurement, TransportError,
};
use metrics::histogram;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::estimator::{ClockEstimate, ClockEstimator, EstimatorSettings};
use crate::interval::AdaptiveInterval;
use crate::observer::{ObserverId, ObserverRegistry, SyncNotification, SyncObserver};
use crate::registry::{lock, InFlightGuard, InFlightRegistry};
use crate::state_machine::{next_state, SyncTrigger};

/// Upper bound on how often the auto-sync loop looks for due devices
const AUTO_SYNC_TICK: Duration = Duration::from_secs(1);

/// Result of a `sync_device` call
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(ClockEstimate),
    /// Another sync or recovery for the device was already running; nothing started
    AlreadyInProgress,
}

impl SyncOutcome {
    pub fn estimate(&self) -> Option<&ClockEstimate> {
        match self {
            Self::Completed(estimate) => Some(estimate),
            Self::AlreadyInProgress => None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::AlreadyInProgress)
    }
}

/// Cancellable background task
struct BackgroundTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct DeviceEntry {
    status: DeviceSyncStatus,
    interval: AdaptiveInterval,
    /// Controller time the next automatic sync is due
    next_sync_at: f64,
    failure: Option<NetworkFailureInfo>,
    /// Cancelled on unregister / shutdown
    cancel: CancellationToken,
    /// Every task touching this device, awaited before removal
    tasks: TaskTracker,
    recovery: Option<BackgroundTask>,
}

enum SpawnedSync {
    Started(JoinHandle<Result<ClockEstimate, SyncError>>),
    AlreadyInProgress,
}

/// Everything a spawned sync task needs
struct SyncJob {
    device_id: DeviceId,
    probes: usize,
    guard: InFlightGuard,
    cancel: CancellationToken,
    stop: Option<CancellationToken>,
    pending_recovery: Option<BackgroundTask>,
    previous: SyncState,
    start_notes: Vec<SyncNotification>,
}

struct Inner<T> {
    transport: Arc<T>,
    clock: SharedClock,
    config: EngineConfig,
    estimator: ClockEstimator,
    backoff: BackoffPolicy,
    devices: Mutex<HashMap<DeviceId, DeviceEntry>>,
    in_flight: InFlightRegistry,
    observers: ObserverRegistry,
    shutdown: CancellationToken,
    auto_sync: Mutex<Option<BackgroundTask>>,
}

/// Clock synchronization engine for a fleet of devices.
///
/// Cheap to clone; clones share the same state.
pub struct TimeSyncEngine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TimeSyncEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TimeSyncEngine<T>
where
    T: DeviceTransport + Sync + 'static,
{
    pub fn new(transport: Arc<T>, clock: SharedClock, config: EngineConfig) -> Self {
        let estimator = ClockEstimator::new(EstimatorSettings::from(&config), clock.clone());
        let backoff = BackoffPolicy::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                transport,
                clock,
                config,
                estimator,
                backoff,
                devices: Mutex::new(HashMap::new()),
                in_flight: InFlightRegistry::new(),
                observers: ObserverRegistry::new(),
                shutdown: CancellationToken::new(),
                auto_sync: Mutex::new(None),
            }),
        }
    }

    /// Register a device in IDLE. Returns `false` if it is already registered.
    pub fn register_device(&self, device_id: impl Into<DeviceId>) -> bool {
        let device_id = device_id.into();
        let inner = &self.inner;
        let total = {
            let mut devices = lock(&inner.devices);
            if devices.contains_key(&device_id) {
                return false;
            }
            let entry = DeviceEntry {
                status: DeviceSyncStatus::new(
                    device_id.clone(),
                    inner.config.max_measurements,
                    inner.config.max_uncertainty_seconds,
                ),
                interval: AdaptiveInterval::new(
                    inner.config.sync_interval(),
                    Duration::from_secs_f64(inner.config.min_resync_interval_seconds),
                ),
                next_sync_at: inner.clock.now(),
                failure: None,
                cancel: inner.shutdown.child_token(),
                tasks: TaskTracker::new(),
                recovery: None,
            };
            devices.insert(device_id.clone(), entry);
            devices.len()
        };

        info!(device_id = %device_id, total, "device registered");
        inner.record_device_counts();
        inner
            .observers
            .notify(&SyncNotification::DeviceRegistered { device_id });
        true
    }

    /// Cancel every task of the device, wait for them, then drop its state.
    #[instrument(name = "engine_unregister_device", skip(self), fields(device_id = %device_id))]
    pub async fn unregister_device(&self, device_id: &str) -> bool {
        let tasks = {
            let mut devices = lock(&self.inner.devices);
            let Some(entry) = devices.get_mut(device_id) else {
                return false;
            };
            entry.cancel.cancel();
            entry.tasks.close();
            entry.recovery.take();
            entry.tasks.clone()
        };

        tasks.wait().await;

        let Some((device_id, _)) = lock(&self.inner.devices).remove_entry(device_id) else {
            return false;
        };
        info!(device_id = %device_id, "device unregistered");
        self.inner.record_device_counts();
        self.inner
            .observers
            .notify(&SyncNotification::DeviceUnregistered { device_id });
        true
    }

    /// Run one probe batch for the device and wait for the result.
    ///
    /// `num_measurements` overrides `probes_per_sync`. A second call while a
    /// sync or recovery is running returns `AlreadyInProgress` immediately.
    #[instrument(name = "engine_sync_device", skip(self), fields(device_id = %device_id))]
    pub async fn sync_device(
        &self,
        device_id: &str,
        num_measurements: Option<usize>,
    ) -> Result<SyncOutcome, SyncError> {
        match self.inner.spawn_sync(device_id, num_measurements, None)? {
            SpawnedSync::AlreadyInProgress => Ok(SyncOutcome::AlreadyInProgress),
            SpawnedSync::Started(handle) => match handle.await {
                Ok(result) => result.map(SyncOutcome::Completed),
                Err(e) if e.is_cancelled() => Err(SyncError::Cancelled(device_id.into())),
                Err(e) => Err(SyncError::Other(format!(
                    "sync task for '{device_id}' failed: {e}"
                ))),
            },
        }
    }

    /// Feed a transport failure seen outside a sync, such as a failed event
    /// send, into the device lifecycle.
    ///
    /// An idle device moves to NETWORK_ERROR and recovery is scheduled.
    /// Busy devices and devices already in NETWORK_ERROR keep their state
    /// and only record `last_error`. Returns whether the device moved.
    pub fn report_transport_failure(&self, device_id: &str, error: &TransportError) -> bool {
        let (moved, notes) = self.inner.apply_transport_failure(device_id, error);
        self.inner.observers.notify_all(notes);
        moved
    }

    /// Start the background resync loop. Returns `false` if already running.
    pub fn start_auto_sync(&self) -> bool {
        let mut slot = lock(&self.inner.auto_sync);
        if slot.as_ref().is_some_and(|running| !running.task.is_finished()) {
            return false;
        }
        let stop = self.inner.shutdown.child_token();
        let task = tokio::spawn(Arc::clone(&self.inner).auto_sync_loop(stop.clone()));
        *slot = Some(BackgroundTask { stop, task });
        info!(
            interval_s = self.inner.config.sync_interval_seconds,
            "auto-sync started"
        );
        true
    }

    /// Stop the resync loop, cancelling the syncs it started, and wait for it.
    pub async fn stop_auto_sync(&self) -> bool {
        let Some(running) = lock(&self.inner.auto_sync).take() else {
            return false;
        };
        running.stop.cancel();
        if let Err(e) = running.task.await {
            warn!(error = %e, "auto-sync loop ended abnormally");
        }
        info!("auto-sync stopped");
        true
    }

    pub fn is_auto_sync_running(&self) -> bool {
        lock(&self.inner.auto_sync)
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Stop auto-sync, cancel every device task and wait for all of them.
    ///
    /// Device statuses stay queryable; new syncs fail with `Cancelled`.
    pub async fn shutdown(&self) {
        self.stop_auto_sync().await;
        self.inner.shutdown.cancel();

        let trackers: Vec<TaskTracker> = lock(&self.inner.devices)
            .values_mut()
            .map(|entry| {
                entry.tasks.close();
                entry.recovery.take();
                entry.tasks.clone()
            })
            .collect();
        for tracker in trackers {
            tracker.wait().await;
        }
        info!("sync engine shut down");
    }

    pub fn subscribe(&self, observer: Arc<dyn SyncObserver>) -> ObserverId {
        self.inner.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    pub fn get_sync_status(&self, device_id: &str) -> Option<DeviceSyncStatus> {
        self.with_entry(device_id, |entry| entry.status.clone())
    }

    /// Statuses of every registered device, ordered by id
    pub fn all_statuses(&self) -> Vec<DeviceSyncStatus> {
        let mut statuses: Vec<_> = lock(&self.inner.devices)
            .values()
            .map(|entry| entry.status.clone())
            .collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    pub fn is_synchronized(&self, device_id: &str) -> bool {
        self.with_entry(device_id, |entry| entry.status.is_synchronized())
            .unwrap_or(false)
    }

    pub fn sync_quality(&self, device_id: &str) -> Option<f64> {
        self.with_entry(device_id, |entry| entry.status.sync_quality())
            .flatten()
    }

    pub fn device_offset(&self, device_id: &str) -> Option<f64> {
        self.with_entry(device_id, |entry| entry.status.offset)
            .flatten()
    }

    pub fn failure_info(&self, device_id: &str) -> Option<NetworkFailureInfo> {
        self.with_entry(device_id, |entry| entry.failure.clone())
            .flatten()
    }

    pub fn current_sync_interval(&self, device_id: &str) -> Option<Duration> {
        self.with_entry(device_id, |entry| entry.interval.current())
    }

    pub fn is_sync_in_progress(&self, device_id: &str) -> bool {
        self.inner.in_flight.is_in_flight(device_id)
    }

    pub fn registered_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = lock(&self.inner.devices).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn synchronized_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = lock(&self.inner.devices)
            .values()
            .filter(|entry| entry.status.is_synchronized())
            .map(|entry| entry.status.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    fn with_entry<R>(&self, device_id: &str, f: impl FnOnce(&DeviceEntry) -> R) -> Option<R> {
        lock(&self.inner.devices).get(device_id).map(f)
    }
}

impl<T> Inner<T>
where
    T: DeviceTransport + Sync + 'static,
{
    /// Claim the device and spawn a sync task on its tracker.
    fn spawn_sync(
        self: &Arc<Self>,
        device_id: &str,
        probes: Option<usize>,
        stop: Option<CancellationToken>,
    ) -> Result<SpawnedSync, SyncError> {
        let device_id = DeviceId::from(device_id);
        let mut devices = lock(&self.devices);
        let entry = devices
            .get_mut(&device_id)
            .ok_or_else(|| SyncError::DeviceNotFound(device_id.clone()))?;

        if entry.cancel.is_cancelled() {
            return Err(SyncError::Cancelled(device_id));
        }

        let Some(guard) = self.in_flight.try_acquire(&device_id) else {
            debug!(device_id = %device_id, "sync already in progress");
            observability::record_sync_rejected(&device_id);
            return Ok(SpawnedSync::AlreadyInProgress);
        };

        let previous = entry.status.state;
        let mut start_notes = Vec::new();
        if !transition(entry, SyncTrigger::SyncRequested, &mut start_notes) {
            return Ok(SpawnedSync::AlreadyInProgress);
        }
        entry.status.sync_attempts += 1;

        let job = SyncJob {
            device_id,
            probes: probes.unwrap_or(self.config.probes_per_sync),
            guard,
            cancel: entry.cancel.clone(),
            stop,
            pending_recovery: entry.recovery.take(),
            previous,
            start_notes,
        };
        let handle = entry.tasks.spawn(Arc::clone(self).run_sync(job));
        Ok(SpawnedSync::Started(handle))
    }

    async fn run_sync(self: Arc<Self>, job: SyncJob) -> Result<ClockEstimate, SyncError> {
        let SyncJob {
            device_id,
            probes,
            guard,
            cancel,
            stop,
            pending_recovery,
            previous,
            start_notes,
        } = job;
        self.observers.notify_all(start_notes);

        if let Some(recovery) = pending_recovery {
            recovery.stop.cancel();
            if let Err(e) = recovery.task.await {
                debug!(device_id = %device_id, error = %e, "pending recovery ended abnormally");
            }
        }

        let stop = stop.unwrap_or_default();
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = stop.cancelled() => None,
            result = self.estimator.estimate(self.transport.as_ref(), &device_id, probes) => Some(result),
        };

        let Some(result) = result else {
            let notes = self.abandon(&device_id, previous);
            drop(guard);
            self.observers.notify_all(notes);
            observability::record_sync_failure(&device_id, "cancelled");
            return Err(SyncError::Cancelled(device_id));
        };

        let notes = self.apply_sync_result(&device_id, &result);
        drop(guard);
        self.observers.notify_all(notes);
        result
    }

    fn apply_sync_result(
        self: &Arc<Self>,
        device_id: &DeviceId,
        result: &Result<ClockEstimate, SyncError>,
    ) -> Vec<SyncNotification> {
        let now = self.clock.now();
        let mut notes = Vec::new();
        let mut devices = lock(&self.devices);
        let Some(entry) = devices.get_mut(device_id) else {
            return notes;
        };
        if entry.cancel.is_cancelled() {
            return notes;
        }

        match result {
            Ok(estimate) => {
                for measurement in &estimate.measurements {
                    histogram!("syncline_probe_rtt_ms")
                        .record(measurement.round_trip_time * 1000.0);
                    entry.status.record_measurement(measurement.clone());
                }
                let status = &mut entry.status;
                status.offset = Some(estimate.offset);
                status.uncertainty = Some(estimate.uncertainty);
                status.last_sync_time = Some(now);
                status.sync_successes += 1;
                status.consecutive_failures = 0;
                status.last_error = None;
                entry.failure = None;

                transition(entry, SyncTrigger::EstimateSucceeded, &mut notes);
                let quality = entry.status.sync_quality().unwrap_or(0.0);
                entry.interval.on_success(quality);

                info!(
                    device_id = %device_id,
                    offset_ms = estimate.offset * 1000.0,
                    uncertainty_ms = estimate.uncertainty * 1000.0,
                    used = estimate.measurements_used,
                    total = estimate.measurements_total,
                    "device synchronized"
                );
                observability::record_sync_success(
                    device_id,
                    estimate.offset,
                    estimate.uncertainty,
                    quality,
                );
                notes.push(SyncNotification::Synchronized {
                    device_id: device_id.clone(),
                    offset: estimate.offset,
                    uncertainty: estimate.uncertainty,
                    quality,
                });
            }
            Err(SyncError::TransportFailure { source, .. }) => {
                entry.status.consecutive_failures += 1;
                entry.status.last_error = Some(source.to_string());
                entry.interval.on_failure();
                transition(entry, SyncTrigger::TransportFailed, &mut notes);

                warn!(device_id = %device_id, kind = %source.kind, error = %source.message, "network failure");
                observability::record_sync_failure(device_id, "transport");
                notes.push(SyncNotification::NetworkFailure {
                    device_id: device_id.clone(),
                    kind: source.kind,
                });

                entry.failure = Some(NetworkFailureInfo::new(device_id.clone(), source.kind, now));
                self.schedule_recovery(entry, device_id, 0, &mut notes);
            }
            Err(e) => {
                entry.status.consecutive_failures += 1;
                entry.status.last_error = Some(e.to_string());
                entry.interval.on_failure();
                transition(entry, SyncTrigger::EstimateFailed, &mut notes);

                warn!(device_id = %device_id, error = %e, "sync rejected by estimator");
                observability::record_sync_failure(device_id, failure_reason(e));
                notes.push(SyncNotification::SyncFailed {
                    device_id: device_id.clone(),
                    error: e.to_string(),
                });
            }
        }

        entry.next_sync_at = now + entry.interval.current().as_secs_f64();
        notes
    }

    fn apply_transport_failure(
        self: &Arc<Self>,
        device_id: &str,
        error: &TransportError,
    ) -> (bool, Vec<SyncNotification>) {
        let now = self.clock.now();
        let mut notes = Vec::new();
        let mut devices = lock(&self.devices);
        let Some(entry) = devices.get_mut(device_id) else {
            return (false, notes);
        };
        if entry.cancel.is_cancelled() {
            return (false, notes);
        }

        entry.status.last_error = Some(error.to_string());
        let state = entry.status.state;
        if state.is_busy() || state == SyncState::NetworkError {
            debug!(device_id = %device_id, %state, error = %error, "transport failure noted");
            return (false, notes);
        }

        let device_id = entry.status.device_id.clone();
        entry.status.consecutive_failures += 1;
        entry.interval.on_failure();
        transition(entry, SyncTrigger::TransportFailed, &mut notes);

        warn!(device_id = %device_id, kind = %error.kind, error = %error.message, "network failure reported outside sync");
        observability::record_sync_failure(&device_id, "transport");
        notes.push(SyncNotification::NetworkFailure {
            device_id: device_id.clone(),
            kind: error.kind,
        });

        entry.failure = Some(NetworkFailureInfo::new(device_id.clone(), error.kind, now));
        self.schedule_recovery(entry, &device_id, 0, &mut notes);
        entry.next_sync_at = now + entry.interval.current().as_secs_f64();
        (true, notes)
    }

    /// Spawn the next recovery attempt and store it in the device slot.
    fn schedule_recovery(
        self: &Arc<Self>,
        entry: &mut DeviceEntry,
        device_id: &DeviceId,
        retry_count: u32,
        notes: &mut Vec<SyncNotification>,
    ) {
        let delay = self.backoff.delay_for_attempt(retry_count);
        let stop = entry.cancel.child_token();
        let task = entry.tasks.spawn(Arc::clone(self).recovery_attempt(
            device_id.clone(),
            delay,
            stop.clone(),
        ));
        entry.recovery = Some(BackgroundTask { stop, task });

        debug!(
            device_id = %device_id,
            attempt = retry_count + 1,
            delay_s = delay.as_secs_f64(),
            "recovery scheduled"
        );
        notes.push(SyncNotification::RecoveryScheduled {
            device_id: device_id.clone(),
            attempt: retry_count + 1,
            delay,
        });
    }

    async fn recovery_attempt(
        self: Arc<Self>,
        device_id: DeviceId,
        delay: Duration,
        stop: CancellationToken,
    ) {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(guard) = self.in_flight.try_acquire(&device_id) else {
            debug!(device_id = %device_id, "recovery skipped, sync in progress");
            return;
        };
        let Some(notes) = self.begin_recovery(&device_id) else {
            return;
        };
        self.observers.notify_all(notes);

        let result = tokio::select! {
            _ = stop.cancelled() => None,
            result = self.estimator.probe(self.transport.as_ref(), &device_id) => Some(result),
        };
        let notes = match result {
            Some(result) => self.apply_recovery_result(&device_id, result),
            None => self.abandon(&device_id, SyncState::NetworkError),
        };
        drop(guard);
        self.observers.notify_all(notes);
    }

    /// NETWORK_ERROR → RECOVERING, unless another task already moved the device on
    fn begin_recovery(&self, device_id: &DeviceId) -> Option<Vec<SyncNotification>> {
        let mut devices = lock(&self.devices);
        let entry = devices.get_mut(device_id)?;
        if entry.cancel.is_cancelled() || entry.status.state != SyncState::NetworkError {
            return None;
        }
        let mut notes = Vec::new();
        transition(entry, SyncTrigger::RecoveryStarted, &mut notes).then_some(notes)
    }

    fn apply_recovery_result(
        self: &Arc<Self>,
        device_id: &DeviceId,
        result: Result<TimeSyncMeasurement, TransportError>,
    ) -> Vec<SyncNotification> {
        let now = self.clock.now();
        let mut notes = Vec::new();
        let mut devices = lock(&self.devices);
        let Some(entry) = devices.get_mut(device_id) else {
            return notes;
        };
        if entry.cancel.is_cancelled() {
            return notes;
        }

        match result {
            Ok(measurement) => {
                let attempts = entry.failure.as_ref().map_or(1, |f| f.retry_count + 1);
                let status = &mut entry.status;
                status.offset = Some(measurement.offset);
                status.uncertainty = Some(measurement.one_way_delay);
                status.last_sync_time = Some(now);
                status.consecutive_failures = 0;
                status.last_error = None;
                status.record_measurement(measurement);
                entry.failure = None;
                entry.recovery = None;
                entry.interval.reset();

                transition(entry, SyncTrigger::RecoverySucceeded, &mut notes);
                info!(device_id = %device_id, attempts, "device recovered");
                observability::record_recovery_attempt(device_id, true);
                notes.push(SyncNotification::Recovered {
                    device_id: device_id.clone(),
                    attempts,
                });
            }
            Err(e) => {
                entry.status.consecutive_failures += 1;
                entry.status.last_error = Some(e.to_string());
                transition(entry, SyncTrigger::RecoveryFailed, &mut notes);
                observability::record_recovery_attempt(device_id, false);

                let failure = entry
                    .failure
                    .get_or_insert_with(|| NetworkFailureInfo::new(device_id.clone(), e.kind, now));
                failure.record_retry(e.kind, now);
                let retries = failure.retry_count;
                let newly_exhausted =
                    retries >= self.config.max_recovery_attempts && !failure.exhausted;
                if retries >= self.config.max_recovery_attempts {
                    failure.exhausted = true;
                }

                if retries < self.config.max_recovery_attempts {
                    debug!(device_id = %device_id, retries, error = %e, "recovery attempt failed");
                    self.schedule_recovery(entry, device_id, retries, &mut notes);
                } else {
                    entry.recovery = None;
                    if newly_exhausted {
                        error!(
                            device_id = %device_id,
                            attempts = retries,
                            "recovery exhausted, automatic retries stopped"
                        );
                        observability::record_permanent_failure(device_id);
                        notes.push(SyncNotification::PermanentFailure {
                            device_id: device_id.clone(),
                            attempts: retries,
                        });
                    }
                }
            }
        }

        entry.next_sync_at = now + entry.interval.current().as_secs_f64();
        notes
    }

    /// Put a cancelled operation's device back into `restore`
    fn abandon(&self, device_id: &DeviceId, restore: SyncState) -> Vec<SyncNotification> {
        let mut notes = Vec::new();
        let mut devices = lock(&self.devices);
        if let Some(entry) = devices.get_mut(device_id) {
            let from = entry.status.state;
            if from.is_busy() && from != restore {
                entry.status.state = restore;
                observability::record_state_transition(from, restore);
                notes.push(SyncNotification::StateChanged {
                    device_id: device_id.clone(),
                    from,
                    to: restore,
                });
            }
        }
        notes
    }

    async fn auto_sync_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sync_interval().min(AUTO_SYNC_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let mut running = Vec::new();
            for device_id in self.due_devices() {
                match self.spawn_sync(&device_id, None, Some(stop.clone())) {
                    Ok(SpawnedSync::Started(handle)) => running.push((device_id, handle)),
                    Ok(SpawnedSync::AlreadyInProgress) => {}
                    Err(e) => debug!(device_id = %device_id, error = %e, "auto-sync skipped"),
                }
            }

            for (device_id, handle) in running {
                match handle.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!(device_id = %device_id, error = %e, "auto-sync attempt failed"),
                    Err(e) => warn!(device_id = %device_id, error = %e, "auto-sync task ended abnormally"),
                }
            }
            self.record_device_counts();
        }
    }

    /// Devices whose adaptive interval elapsed. NETWORK_ERROR devices are
    /// left to the recovery chain, or to the caller once it is exhausted.
    fn due_devices(&self) -> Vec<DeviceId> {
        let now = self.clock.now();
        lock(&self.devices)
            .iter()
            .filter(|(_, entry)| {
                !entry.cancel.is_cancelled()
                    && now >= entry.next_sync_at
                    && !entry.status.state.is_busy()
                    && entry.status.state != SyncState::NetworkError
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn record_device_counts(&self) {
        let devices = lock(&self.devices);
        let synchronized = devices
            .values()
            .filter(|entry| entry.status.is_synchronized())
            .count();
        observability::record_device_counts(devices.len(), synchronized);
    }
}

/// Apply a state machine transition, recording the change
fn transition(
    entry: &mut DeviceEntry,
    trigger: SyncTrigger,
    notes: &mut Vec<SyncNotification>,
) -> bool {
    let from = entry.status.state;
    match next_state(from, trigger) {
        Ok(to) => {
            entry.status.state = to;
            if from != to {
                debug!(device_id = %entry.status.device_id, %from, %to, "state changed");
                observability::record_state_transition(from, to);
                notes.push(SyncNotification::StateChanged {
                    device_id: entry.status.device_id.clone(),
                    from,
                    to,
                });
            }
            true
        }
        Err(e) => {
            warn!(device_id = %entry.status.device_id, error = %e, "transition ignored");
            false
        }
    }
}

fn failure_reason(error: &SyncError) -> &'static str {
    match error {
        SyncError::InsufficientMeasurements { .. } => "insufficient_measurements",
        SyncError::UncertaintyTooHigh { .. } => "uncertainty_too_high",
        SyncError::TransportFailure { .. } => "transport",
        SyncError::Cancelled(_) => "cancelled",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{MonotonicClock, SimulationProfile};
    use transport::SimulatedTransport;

    type Notes = Arc<Mutex<Vec<SyncNotification>>>;

    fn profile(offset_ms: f64, latency_ms: f64) -> SimulationProfile {
        SimulationProfile {
            clock_offset_ms: offset_ms,
            latency_ms,
            latency_jitter_ms: 0.0,
            ..Default::default()
        }
    }

    fn setup(devices: &[(&str, SimulationProfile)]) -> (TimeSyncEngine<SimulatedTransport>, Notes) {
        let clock: SharedClock = Arc::new(MonotonicClock::new(1_000.0));
        let transport = Arc::new(SimulatedTransport::new(clock.clone(), Some(11)));
        let config = EngineConfig {
            rng_seed: Some(5),
            ..Default::default()
        };
        let engine = TimeSyncEngine::new(transport.clone(), clock, config);

        let notes: Notes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notes);
        engine.subscribe(Arc::new(move |n: &SyncNotification| {
            sink.lock().unwrap().push(n.clone());
        }));

        for (id, profile) in devices {
            transport.add_device(*id, profile.clone());
            assert!(engine.register_device(*id));
        }
        (engine, notes)
    }

    fn count(notes: &Notes, kind: &str) -> usize {
        notes.lock().unwrap().iter().filter(|n| n.kind() == kind).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_device_is_not_synchronized() {
        let (engine, notes) = setup(&[("d1", profile(0.0, 5.0))]);

        let status = engine.get_sync_status("d1").unwrap();
        assert_eq!(status.state, SyncState::Idle);
        assert!(!engine.is_synchronized("d1"));
        assert_eq!(engine.sync_quality("d1"), None);
        assert!(!engine.register_device("d1"));
        assert_eq!(count(&notes, "device_registered"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_device_success() {
        let (engine, notes) = setup(&[("d1", profile(120.0, 5.0))]);

        let outcome = engine.sync_device("d1", None).await.unwrap();
        let estimate = outcome.estimate().unwrap();
        assert!((estimate.offset - 0.120).abs() < 1e-6);

        let status = engine.get_sync_status("d1").unwrap();
        assert_eq!(status.state, SyncState::Synchronized);
        assert_eq!(status.measurements.len(), 5);
        assert!(status.uncertainty.unwrap() <= engine.config().max_uncertainty_seconds);
        assert!(engine.is_synchronized("d1"));
        assert_eq!(engine.synchronized_devices(), vec![DeviceId::from("d1")]);

        let kinds: Vec<_> = notes.lock().unwrap().iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec!["device_registered", "state_changed", "state_changed", "synchronized"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sync_rejected() {
        let (engine, _) = setup(&[("d1", profile(0.0, 20.0))]);

        let (first, second) =
            tokio::join!(engine.sync_device("d1", None), engine.sync_device("d1", None));
        let outcomes = [first.unwrap(), second.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.is_in_progress()).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.estimate().is_some()).count(), 1);
        assert_eq!(engine.transport().probes_received("d1"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device() {
        let (engine, _) = setup(&[]);
        let err = engine.sync_device("ghost", None).await.unwrap_err();
        assert!(matches!(err, SyncError::DeviceNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimator_rejection_moves_to_error() {
        let (engine, notes) = setup(&[("d1", profile(0.0, 5.0))]);

        let err = engine.sync_device("d1", Some(2)).await.unwrap_err();
        assert!(matches!(err, SyncError::InsufficientMeasurements { .. }));

        let status = engine.get_sync_status("d1").unwrap();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(count(&notes, "sync_failed"), 1);
        assert_eq!(
            engine.current_sync_interval("d1"),
            Some(Duration::from_secs(15))
        );

        // ERROR may be retried directly
        assert!(engine.sync_device("d1", None).await.is_ok());
        assert!(engine.is_synchronized("d1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_device_gives_up_after_five_recoveries() {
        let (engine, notes) = setup(&[("d1", profile(0.0, 5.0))]);
        engine.transport().set_online("d1", false);

        let err = engine.sync_device("d1", None).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(
            engine.get_sync_status("d1").unwrap().state,
            SyncState::NetworkError
        );

        // 1 + 2 + 4 + 8 + 16 seconds of backoff, ±10%
        tokio::time::sleep(Duration::from_secs(120)).await;

        let failure = engine.failure_info("d1").unwrap();
        assert_eq!(failure.retry_count, 5);
        assert!(failure.exhausted);
        assert_eq!(count(&notes, "recovery_scheduled"), 5);
        assert_eq!(count(&notes, "permanent_failure"), 1);
        assert_eq!(engine.transport().probes_received("d1"), 10);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(engine.transport().probes_received("d1"), 10);
        assert_eq!(count(&notes, "permanent_failure"), 1);
        assert_eq!(
            engine.get_sync_status("d1").unwrap().state,
            SyncState::NetworkError
        );

        // Explicit re-trigger starts over
        engine.transport().set_online("d1", true);
        assert!(engine.sync_device("d1", None).await.is_ok());
        assert!(engine.failure_info("d1").is_none());
        assert!(engine.is_synchronized("d1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_moves_synced_device_to_network_error() {
        let (engine, notes) = setup(&[("d1", profile(20.0, 5.0))]);
        engine.sync_device("d1", None).await.unwrap();
        assert!(engine.is_synchronized("d1"));

        let error = TransportError::unreachable("event send refused");
        assert!(engine.report_transport_failure("d1", &error));

        let status = engine.get_sync_status("d1").unwrap();
        assert_eq!(status.state, SyncState::NetworkError);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.unwrap().contains("event send refused"));
        assert!(engine.failure_info("d1").is_some());
        assert_eq!(count(&notes, "network_failure"), 1);
        assert_eq!(count(&notes, "recovery_scheduled"), 1);

        // Already in NETWORK_ERROR: recorded, no second transition
        assert!(!engine.report_transport_failure("d1", &error));
        assert_eq!(count(&notes, "network_failure"), 1);
        assert!(!engine.report_transport_failure("ghost", &error));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_restores_sync() {
        let (engine, notes) = setup(&[("d1", profile(40.0, 5.0))]);
        engine.transport().set_online("d1", false);
        assert!(engine.sync_device("d1", None).await.is_err());

        engine.transport().set_online("d1", true);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(engine.failure_info("d1").is_none());
        assert!(engine.is_synchronized("d1"));
        assert!((engine.device_offset("d1").unwrap() - 0.040).abs() < 1e-6);
        assert_eq!(count(&notes, "recovered"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_cancels_in_flight_sync() {
        let (engine, notes) = setup(&[("d1", profile(0.0, 400.0))]);

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_device("d1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.is_sync_in_progress("d1"));

        assert!(engine.unregister_device("d1").await);
        let result = running.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled(_))));
        assert!(engine.get_sync_status("d1").is_none());
        assert!(!engine.is_sync_in_progress("d1"));
        assert!(!engine.unregister_device("d1").await);
        assert_eq!(count(&notes, "device_unregistered"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_synchronizes_and_stops() {
        let (engine, _) = setup(&[("a", profile(3.0, 5.0)), ("b", profile(-8.0, 5.0))]);

        assert!(engine.start_auto_sync());
        assert!(!engine.start_auto_sync());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(engine.synchronized_devices().len(), 2);
        assert!(engine.stop_auto_sync().await);
        assert!(!engine.is_auto_sync_running());
        assert!(!engine.stop_auto_sync().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_work() {
        let (engine, _) = setup(&[("d1", profile(0.0, 5.0))]);
        engine.start_auto_sync();
        engine.shutdown().await;

        assert!(!engine.is_auto_sync_running());
        let err = engine.sync_device("d1", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled(_)));
        assert_eq!(engine.registered_devices().len(), 1);
    }
}
