//! Engine notifications and the observer registry.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use contracts::{DeviceId, FailureKind, SyncState};

use crate::registry::lock;

/// Lifecycle notification emitted by `TimeSyncEngine`
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotification {
    DeviceRegistered {
        device_id: DeviceId,
    },
    DeviceUnregistered {
        device_id: DeviceId,
    },
    StateChanged {
        device_id: DeviceId,
        from: SyncState,
        to: SyncState,
    },
    Synchronized {
        device_id: DeviceId,
        offset: f64,
        uncertainty: f64,
        quality: f64,
    },
    /// Estimator rejected the batch
    SyncFailed {
        device_id: DeviceId,
        error: String,
    },
    NetworkFailure {
        device_id: DeviceId,
        kind: FailureKind,
    },
    RecoveryScheduled {
        device_id: DeviceId,
        /// 1-based number of the upcoming attempt
        attempt: u32,
        delay: Duration,
    },
    Recovered {
        device_id: DeviceId,
        attempts: u32,
    },
    /// Automatic recovery gave up; emitted once per outage
    PermanentFailure {
        device_id: DeviceId,
        attempts: u32,
    },
}

impl SyncNotification {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::DeviceRegistered { device_id }
            | Self::DeviceUnregistered { device_id }
            | Self::StateChanged { device_id, .. }
            | Self::Synchronized { device_id, .. }
            | Self::SyncFailed { device_id, .. }
            | Self::NetworkFailure { device_id, .. }
            | Self::RecoveryScheduled { device_id, .. }
            | Self::Recovered { device_id, .. }
            | Self::PermanentFailure { device_id, .. } => device_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceRegistered { .. } => "device_registered",
            Self::DeviceUnregistered { .. } => "device_unregistered",
            Self::StateChanged { .. } => "state_changed",
            Self::Synchronized { .. } => "synchronized",
            Self::SyncFailed { .. } => "sync_failed",
            Self::NetworkFailure { .. } => "network_failure",
            Self::RecoveryScheduled { .. } => "recovery_scheduled",
            Self::Recovered { .. } => "recovered",
            Self::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

/// Receives engine notifications.
///
/// Called synchronously on the task that produced the notification, after
/// the engine released its locks; keep it cheap.
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, notification: &SyncNotification);
}

impl<F> SyncObserver for F
where
    F: Fn(&SyncNotification) + Send + Sync,
{
    fn on_event(&self, notification: &SyncNotification) {
        self(notification)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<(ObserverId, Arc<dyn SyncObserver>)>>,
    next_id: Mutex<u64>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn SyncObserver>) -> ObserverId {
        let id = {
            let mut next = lock(&self.next_id);
            *next += 1;
            ObserverId(*next)
        };
        lock(&self.observers).push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every observer. The list is snapshotted first so an
    /// observer may subscribe or unsubscribe from inside `on_event`.
    pub fn notify(&self, notification: &SyncNotification) {
        let snapshot: Vec<Arc<dyn SyncObserver>> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            observer.on_event(notification);
        }
    }

    pub fn notify_all(&self, notifications: impl IntoIterator<Item = SyncNotification>) {
        for notification in notifications {
            self.notify(&notification);
        }
    }
}
