//! Device groups and relative synchronization quality

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use contracts::{Clock, CoordinationQuality, DeviceId, DeviceTransport, SyncState};
use serde::Serialize;
use sync_engine::{SyncOutcome, TimeSyncEngine};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::error::CoordinationError;
use crate::lock;

/// Coordinator device and spread of a set of synchronized offsets
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetSpread {
    /// Member with the smallest absolute offset
    pub coordinator: DeviceId,
    /// max(offset) - min(offset), seconds
    pub spread: f64,
    pub quality: CoordinationQuality,
}

/// Rate a set of `(device, offset)` pairs. `None` when empty.
pub fn assess_offsets(offsets: &[(DeviceId, f64)]) -> Option<OffsetSpread> {
    let (coordinator, _) = offsets
        .iter()
        .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))?;
    let (min, max) = offsets
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, o)| {
            (lo.min(*o), hi.max(*o))
        });
    let spread = max - min;
    Some(OffsetSpread {
        coordinator: coordinator.clone(),
        spread,
        quality: CoordinationQuality::from_spread(spread),
    })
}

/// One member's outcome within a group sync
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberSyncResult {
    pub device_id: DeviceId,
    /// `None` when the device was unregistered mid-sync
    pub state: Option<SyncState>,
    pub offset: Option<f64>,
    pub uncertainty: Option<f64>,
    pub success_rate: f64,
    pub synchronized: bool,
    /// Another sync was already running for this member
    pub already_in_progress: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSyncReport {
    pub group: String,
    pub coordinator: Option<DeviceId>,
    /// Seconds; `None` without a synchronized member
    pub spread: Option<f64>,
    pub quality: CoordinationQuality,
    /// Weakest member's success rate
    pub success_rate: f64,
    pub results: BTreeMap<DeviceId, MemberSyncResult>,
    pub synchronized: Vec<DeviceId>,
    pub failed: Vec<DeviceId>,
    pub started_at: f64,
    pub finished_at: f64,
}

impl GroupSyncReport {
    pub fn spread_ms(&self) -> Option<f64> {
        self.spread.map(|s| s * 1000.0)
    }

    pub fn all_synchronized(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Relative quality computed from the engine's current statuses
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupQuality {
    pub group: String,
    pub members: usize,
    pub synchronized: usize,
    pub coordinator: Option<DeviceId>,
    pub spread: Option<f64>,
    pub quality: CoordinationQuality,
    pub success_rate: f64,
}

/// Named device groups synchronized together
pub struct MultiDeviceCoordinator<T> {
    engine: TimeSyncEngine<T>,
    groups: Mutex<BTreeMap<String, Vec<DeviceId>>>,
    reports: Mutex<HashMap<String, GroupSyncReport>>,
}

impl<T> MultiDeviceCoordinator<T>
where
    T: DeviceTransport + Sync + 'static,
{
    pub fn new(engine: TimeSyncEngine<T>) -> Self {
        Self {
            engine,
            groups: Mutex::new(BTreeMap::new()),
            reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &TimeSyncEngine<T> {
        &self.engine
    }

    /// Members must already be registered with the engine
    pub fn create_group(
        &self,
        name: impl Into<String>,
        devices: impl IntoIterator<Item = impl Into<DeviceId>>,
    ) -> Result<(), CoordinationError> {
        let name = name.into();
        let mut seen = HashSet::new();
        let members: Vec<DeviceId> = devices
            .into_iter()
            .map(Into::into)
            .filter(|id: &DeviceId| seen.insert(id.clone()))
            .collect();
        if members.is_empty() {
            return Err(CoordinationError::EmptyGroup(name));
        }

        let registered: HashSet<DeviceId> = self.engine.registered_devices().into_iter().collect();
        if let Some(unknown) = members.iter().find(|id| !registered.contains(*id)) {
            return Err(CoordinationError::unknown_device(name, unknown.clone()));
        }

        let mut groups = lock(&self.groups);
        if groups.contains_key(&name) {
            return Err(CoordinationError::GroupExists(name));
        }
        info!(group = %name, members = members.len(), "Group created");
        groups.insert(name, members);
        Ok(())
    }

    pub fn remove_group(&self, name: &str) -> bool {
        lock(&self.reports).remove(name);
        lock(&self.groups).remove(name).is_some()
    }

    /// `(name, members)` sorted by name
    pub fn groups(&self) -> Vec<(String, Vec<DeviceId>)> {
        lock(&self.groups)
            .iter()
            .map(|(name, members)| (name.clone(), members.clone()))
            .collect()
    }

    pub fn group_members(&self, name: &str) -> Option<Vec<DeviceId>> {
        lock(&self.groups).get(name).cloned()
    }

    pub fn last_report(&self, name: &str) -> Option<GroupSyncReport> {
        lock(&self.reports).get(name).cloned()
    }

    /// Sync every member concurrently and rate the group
    #[instrument(name = "group_sync", skip(self), fields(group = %name))]
    pub async fn coordinate_group_sync(
        &self,
        name: &str,
    ) -> Result<GroupSyncReport, CoordinationError> {
        let members = self
            .group_members(name)
            .ok_or_else(|| CoordinationError::GroupNotFound(name.to_string()))?;
        let started_at = self.engine.clock().now();

        let mut syncs = JoinSet::new();
        for device_id in members.iter().cloned() {
            let engine = self.engine.clone();
            syncs.spawn(async move {
                let result = engine.sync_device(&device_id, None).await;
                (device_id, result)
            });
        }

        let mut errors: HashMap<DeviceId, String> = HashMap::new();
        let mut in_progress: HashSet<DeviceId> = HashSet::new();
        while let Some(joined) = syncs.join_next().await {
            match joined {
                Ok((_, Ok(SyncOutcome::Completed(_)))) => {}
                Ok((device_id, Ok(SyncOutcome::AlreadyInProgress))) => {
                    in_progress.insert(device_id);
                }
                Ok((device_id, Err(e))) => {
                    errors.insert(device_id, e.to_string());
                }
                Err(e) => warn!(error = %e, "member sync task failed"),
            }
        }

        let mut results = BTreeMap::new();
        for device_id in &members {
            let mut result = self.member_result(device_id);
            result.already_in_progress = in_progress.contains(device_id);
            result.error = errors.remove(device_id);
            results.insert(device_id.clone(), result);
        }

        let report = self.build_report(name, results, started_at);
        observability::record_group_sync(name, report.spread, report.success_rate);
        match &report.spread {
            Some(spread) => info!(
                group = %name,
                synchronized = report.synchronized.len(),
                failed = report.failed.len(),
                spread_ms = spread * 1000.0,
                quality = %report.quality,
                "Group sync finished"
            ),
            None => warn!(group = %name, failed = report.failed.len(), "No group member synchronized"),
        }

        lock(&self.reports).insert(name.to_string(), report.clone());
        Ok(report)
    }

    /// Relative quality from current statuses, without probing
    pub fn group_quality(&self, name: &str) -> Result<GroupQuality, CoordinationError> {
        let members = self
            .group_members(name)
            .ok_or_else(|| CoordinationError::GroupNotFound(name.to_string()))?;
        let results = members
            .iter()
            .map(|id| (id.clone(), self.member_result(id)))
            .collect();
        let report = self.build_report(name, results, self.engine.clock().now());

        Ok(GroupQuality {
            group: report.group,
            members: members.len(),
            synchronized: report.synchronized.len(),
            coordinator: report.coordinator,
            spread: report.spread,
            quality: report.quality,
            success_rate: report.success_rate,
        })
    }

    fn member_result(&self, device_id: &DeviceId) -> MemberSyncResult {
        let status = self.engine.get_sync_status(device_id);
        MemberSyncResult {
            device_id: device_id.clone(),
            state: status.as_ref().map(|s| s.state),
            offset: status.as_ref().and_then(|s| s.offset),
            uncertainty: status.as_ref().and_then(|s| s.uncertainty),
            success_rate: status.as_ref().map_or(0.0, |s| s.success_rate()),
            synchronized: status.as_ref().is_some_and(|s| s.is_synchronized()),
            already_in_progress: false,
            error: None,
        }
    }

    fn build_report(
        &self,
        name: &str,
        results: BTreeMap<DeviceId, MemberSyncResult>,
        started_at: f64,
    ) -> GroupSyncReport {
        let (synchronized, failed): (Vec<&MemberSyncResult>, Vec<&MemberSyncResult>) =
            results.values().partition(|r| r.synchronized);

        let offsets: Vec<(DeviceId, f64)> = synchronized
            .iter()
            .filter_map(|r| r.offset.map(|o| (r.device_id.clone(), o)))
            .collect();
        let assessed = assess_offsets(&offsets);

        let success_rate = results
            .values()
            .map(|r| r.success_rate)
            .fold(None, |acc: Option<f64>, rate| Some(acc.map_or(rate, |a| a.min(rate))))
            .unwrap_or(0.0);

        GroupSyncReport {
            group: name.to_string(),
            coordinator: assessed.as_ref().map(|a| a.coordinator.clone()),
            spread: assessed.as_ref().map(|a| a.spread),
            quality: assessed.map_or(CoordinationQuality::Poor, |a| a.quality),
            success_rate,
            synchronized: synchronized.iter().map(|r| r.device_id.clone()).collect(),
            failed: failed.iter().map(|r| r.device_id.clone()).collect(),
            results,
            started_at,
            finished_at: self.engine.clock().now(),
        }
    }
}
