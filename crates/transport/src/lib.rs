//! # Transport
//!
//! Device transport implementations.
//!
//! The production transport (UDP discovery + TCP command channel) is provided
//! by the host application. This crate ships the simulated fleet used by the
//! CLI and by tests: every device has a configurable clock offset, network
//! latency, loss rate and trigger detector, driven by a seedable RNG.

pub mod simulated;

pub use contracts::{DeviceTransport, SimulationProfile};
pub use simulated::{SimulatedDevice, SimulatedTransport, TransportStats};
