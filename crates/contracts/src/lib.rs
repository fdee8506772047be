//! # Contracts
//!
//! Frozen interface contracts shared by every crate in the workspace.
//! Business crates depend on this crate only; reverse dependencies are prohibited.
//!
//! ## Time Model
//! - Controller time is seconds (f64) from a [`Clock`]
//! - Offsets are device clock minus controller clock, in seconds
//! - Event wire timestamps are epoch milliseconds

mod calibration;
mod clock;
mod config;
mod device_id;
mod error;
mod event;
mod failure;
mod measurement;
mod quality;
mod status;
mod transport;

pub use calibration::*;
pub use clock::{Clock, MonotonicClock, SharedClock, SystemClock};
pub use config::*;
pub use device_id::DeviceId;
pub use error::*;
pub use event::*;
pub use failure::*;
pub use measurement::*;
pub use quality::*;
pub use status::*;
pub use transport::{DeviceTransport, LocalDeviceTransport};
