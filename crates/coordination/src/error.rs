//! Coordination error types

use contracts::{DeviceId, SyncError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Broadcast requested with an empty target set
    #[error("event has no target devices")]
    NoTargets,

    #[error("group '{0}' already exists")]
    GroupExists(String),

    #[error("group '{0}' not found")]
    GroupNotFound(String),

    #[error("group '{0}' has no members")]
    EmptyGroup(String),

    /// Group member not registered with the engine
    #[error("device '{device_id}' in group '{group}' is not registered")]
    UnknownDevice { group: String, device_id: DeviceId },

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl CoordinationError {
    pub fn unknown_device(group: impl Into<String>, device_id: DeviceId) -> Self {
        Self::UnknownDevice {
            group: group.into(),
            device_id,
        }
    }
}
