//! Layered error definitions
//!
//! Categorized by source: config / estimation / transport / engine

use thiserror::Error;

use crate::{DeviceId, FailureKind};

/// Failure reported by a [`DeviceTransport`](crate::DeviceTransport) call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unreachable, message)
    }
}

/// Unified error type
#[derive(Debug, Error)]
pub enum SyncError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Estimation Errors =====
    /// Too few measurements survived outlier filtering
    #[error(
        "insufficient measurements for '{device_id}': {valid} valid, {required} required"
    )]
    InsufficientMeasurements {
        device_id: DeviceId,
        valid: usize,
        required: usize,
    },

    /// Aggregated uncertainty above the configured ceiling
    #[error(
        "uncertainty too high for '{device_id}': {uncertainty_ms:.3}ms > {max_ms:.3}ms"
    )]
    UncertaintyTooHigh {
        device_id: DeviceId,
        uncertainty_ms: f64,
        max_ms: f64,
    },

    // ===== Transport Errors =====
    /// Probe or event send failed
    #[error("transport failure for '{device_id}': {source}")]
    TransportFailure {
        device_id: DeviceId,
        #[source]
        source: TransportError,
    },

    // ===== Engine Errors =====
    /// Device is not registered
    #[error("device not registered: {0}")]
    DeviceNotFound(DeviceId),

    /// In-flight operation was cancelled (unregister / shutdown)
    #[error("operation for '{0}' was cancelled")]
    Cancelled(DeviceId),

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create transport failure error
    pub fn transport(device_id: DeviceId, source: TransportError) -> Self {
        Self::TransportFailure { device_id, source }
    }

    /// Whether this failure moves a device into NETWORK_ERROR rather than ERROR
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }
}
