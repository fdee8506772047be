//! Calibration error types

use contracts::DeviceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration requires at least one device")]
    NoDevices,

    #[error("invalid calibration plan: {0}")]
    InvalidPlan(String),

    #[error("device '{0}' is not registered")]
    UnknownDevice(DeviceId),
}
