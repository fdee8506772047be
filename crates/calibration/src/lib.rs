//! # Calibration
//!
//! 物理触发事件校准。
//!
//! 负责：
//! - 在记录的参考时刻触发可观测事件（闪光、音频、时间戳标记）
//! - 收集各设备的检测时间戳与置信度
//! - 计算与 RTT 估计无关的真实同步误差，给出评估与建议

pub mod analysis;
pub mod engine;
pub mod error;

pub use analysis::{analyze_session, assess};
pub use contracts::{
    CalibrationAnalysis, CalibrationAssessment, CalibrationEventKind, CalibrationPlan,
    CalibrationSession,
};
pub use engine::CalibrationEngine;
pub use error::CalibrationError;
