//! # Coordination
//!
//! 多设备协调模块。
//!
//! 负责：
//! - 向设备集合广播带时间戳的协调事件，收集确认并评估广播质量
//! - 周期性心跳广播
//! - 设备分组、组内并行同步与相对同步质量评估

pub mod error;
pub mod events;
pub mod groups;

pub use contracts::{EventPayload, EventPriority, SyncEvent, SyncEventKind, SyncEventStatus};
pub use error::CoordinationError;
pub use events::{EventCoordinator, EventHandler, EventStatistics, HandlerId};
pub use groups::{
    assess_offsets, GroupQuality, GroupSyncReport, MemberSyncResult, MultiDeviceCoordinator,
    OffsetSpread,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
