//! Keyed in-flight registry: at most one operation per device.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use contracts::DeviceId;

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    active: Arc<Mutex<HashSet<DeviceId>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the device; `None` when an operation is already running.
    ///
    /// The claim is released when the guard is dropped.
    pub fn try_acquire(&self, device_id: &DeviceId) -> Option<InFlightGuard> {
        if !lock(&self.active).insert(device_id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            active: Arc::clone(&self.active),
            device_id: device_id.clone(),
        })
    }

    pub fn is_in_flight(&self, device_id: &str) -> bool {
        lock(&self.active).contains(device_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    active: Arc<Mutex<HashSet<DeviceId>>>,
    device_id: DeviceId,
}

impl InFlightGuard {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.device_id);
    }
}
