//! Simulated fleet wiring: transport, engine, coordinators and calibration.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use calibration::CalibrationEngine;
use contracts::{ControllerBlueprint, DeviceId, MonotonicClock, SharedClock};
use coordination::{EventCoordinator, MultiDeviceCoordinator};
use observability::SyncMetricsAggregator;
use sync_engine::{SyncNotification, TimeSyncEngine};
use tokio::task::JoinSet;
use tracing::{info, warn};
use transport::SimulatedTransport;

pub type Transport = SimulatedTransport;

/// Every controller component over one simulated transport
pub struct Fleet {
    pub transport: Arc<Transport>,
    pub engine: TimeSyncEngine<Transport>,
    pub events: EventCoordinator<Transport>,
    pub groups: MultiDeviceCoordinator<Transport>,
    pub calibration: CalibrationEngine<Transport>,
    pub devices: Vec<DeviceId>,
    pub metrics: Arc<Mutex<SyncMetricsAggregator>>,
}

impl Fleet {
    pub fn build(blueprint: &ControllerBlueprint) -> Result<Self> {
        let clock: SharedClock = Arc::new(MonotonicClock::from_system());
        let transport = Arc::new(SimulatedTransport::new(
            clock.clone(),
            blueprint.engine.rng_seed,
        ));
        let engine = TimeSyncEngine::new(transport.clone(), clock, blueprint.engine.clone());

        let metrics = Arc::new(Mutex::new(SyncMetricsAggregator::new()));
        let sink = Arc::clone(&metrics);
        engine.subscribe(Arc::new(move |note: &SyncNotification| {
            record_notification(&sink, note);
        }));

        let mut devices = Vec::with_capacity(blueprint.devices.len());
        for device in &blueprint.devices {
            transport.add_device(device.id.as_str(), device.simulation.clone());
            engine.register_device(device.id.as_str());
            devices.push(DeviceId::from(device.id.as_str()));
        }

        let events = EventCoordinator::for_engine(&engine);
        let groups = MultiDeviceCoordinator::new(engine.clone());
        for group in &blueprint.groups {
            groups
                .create_group(group.name.as_str(), group.devices.iter().map(String::as_str))
                .with_context(|| format!("Failed to create group '{}'", group.name))?;
        }
        let calibration = CalibrationEngine::new(engine.clone());

        info!(
            devices = devices.len(),
            groups = blueprint.groups.len(),
            "Simulated fleet ready"
        );

        Ok(Self {
            transport,
            engine,
            events,
            groups,
            calibration,
            devices,
            metrics,
        })
    }

    /// Sync every device once, concurrently; returns how many synchronized
    pub async fn sync_all(&self) -> usize {
        let mut syncs = JoinSet::new();
        for device_id in self.devices.iter().cloned() {
            let engine = self.engine.clone();
            syncs.spawn(async move {
                let result = engine.sync_device(&device_id, None).await;
                (device_id, result)
            });
        }
        while let Some(joined) = syncs.join_next().await {
            match joined {
                Ok((device_id, Err(e))) => {
                    warn!(device_id = %device_id, error = %e, "initial sync failed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "sync task failed"),
            }
        }
        self.engine.synchronized_devices().len()
    }

    pub async fn shutdown(&self) {
        self.events.shutdown().await;
        self.engine.shutdown().await;
    }

    /// Fold the event history into the run metrics
    pub fn collect_event_metrics(&self) {
        let history = self.events.event_history();
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        for status in &history {
            metrics.record_event(status);
        }
    }
}

fn record_notification(metrics: &Mutex<SyncMetricsAggregator>, note: &SyncNotification) {
    let mut metrics = metrics.lock().unwrap_or_else(PoisonError::into_inner);
    match note {
        SyncNotification::Synchronized {
            device_id,
            offset,
            uncertainty,
            ..
        } => metrics.record_sync_success(device_id, *offset, *uncertainty),
        SyncNotification::SyncFailed { .. } => metrics.record_sync_failure(false),
        SyncNotification::NetworkFailure { .. } => metrics.record_sync_failure(true),
        SyncNotification::RecoveryScheduled { attempt, .. } if *attempt > 1 => {
            metrics.record_recovery(false)
        }
        SyncNotification::Recovered { .. } => metrics.record_recovery(true),
        SyncNotification::PermanentFailure { .. } => metrics.record_permanent_failure(),
        _ => {}
    }
}
