//! # Sync Engine
//!
//! 设备时钟同步引擎。
//!
//! 负责：
//! - 往返探测估计时钟偏移与不确定度（离群值过滤）
//! - 设备同步状态机
//! - 网络失败后的指数退避恢复
//! - 自适应重同步间隔与自动同步循环
//!
//! ## 使用示例
//!
//! ```ignore
//! use sync_engine::{SyncOutcome, TimeSyncEngine};
//!
//! let engine = TimeSyncEngine::new(transport, clock, EngineConfig::default());
//! engine.register_device("phone-a");
//!
//! if let SyncOutcome::Completed(estimate) = engine.sync_device("phone-a", None).await? {
//!     println!("offset: {:.3} ms", estimate.offset * 1000.0);
//! }
//! engine.start_auto_sync();
//! ```

mod backoff;
mod engine;
mod estimator;
mod interval;
mod observer;
mod registry;
pub mod state_machine;
pub mod stats;

pub use backoff::BackoffPolicy;
pub use engine::{SyncOutcome, TimeSyncEngine};
pub use estimator::{aggregate, filter_outliers, ClockEstimate, ClockEstimator, EstimatorSettings};
pub use interval::AdaptiveInterval;
pub use observer::{ObserverId, ObserverRegistry, SyncNotification, SyncObserver};
pub use registry::{InFlightGuard, InFlightRegistry};
pub use state_machine::{next_state, InvalidTransition, SyncTrigger};

// Re-export contracts types
pub use contracts::{
    DeviceSyncStatus, DeviceTransport, EngineConfig, NetworkFailureInfo, SyncError, SyncState,
    TimeSyncMeasurement,
};
