//! 配置校验模块
//!
//! 校验规则：
//! - 字段取值范围 (validator derive)
//! - device id 非空且唯一
//! - group 名称唯一，成员必须是已声明的设备
//! - min_measurements 不超过每批探测数与窗口大小
//! - 日志级别合法

use std::collections::HashSet;

use contracts::{ControllerBlueprint, SyncError};
use validator::Validate;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// 校验 ControllerBlueprint
///
/// 返回第一个遇到的错误，或 Ok(())。
pub fn validate(blueprint: &ControllerBlueprint) -> Result<(), SyncError> {
    validate_ranges(blueprint)?;
    validate_device_ids(blueprint)?;
    validate_groups(blueprint)?;
    validate_engine(blueprint)?;
    validate_log_level(blueprint)?;
    Ok(())
}

fn validate_ranges(blueprint: &ControllerBlueprint) -> Result<(), SyncError> {
    blueprint.validate().map_err(|errors| {
        let mut fields: Vec<_> = errors.errors().keys().map(|k| k.to_string()).collect();
        fields.sort();
        let field = fields.first().cloned().unwrap_or_else(|| "blueprint".into());
        SyncError::config_validation(field, errors.to_string())
    })
}

fn validate_device_ids(blueprint: &ControllerBlueprint) -> Result<(), SyncError> {
    let mut seen = HashSet::new();
    for (idx, device) in blueprint.devices.iter().enumerate() {
        if device.id.trim().is_empty() {
            return Err(SyncError::config_validation(
                format!("devices[{idx}].id"),
                "device id cannot be blank",
            ));
        }
        if !seen.insert(device.id.as_str()) {
            return Err(SyncError::config_validation(
                format!("devices[id={}]", device.id),
                "duplicate device id",
            ));
        }
    }
    Ok(())
}

fn validate_groups(blueprint: &ControllerBlueprint) -> Result<(), SyncError> {
    let devices: HashSet<_> = blueprint.devices.iter().map(|d| d.id.as_str()).collect();
    let mut names = HashSet::new();

    for group in &blueprint.groups {
        if !names.insert(group.name.as_str()) {
            return Err(SyncError::config_validation(
                format!("groups[name={}]", group.name),
                "duplicate group name",
            ));
        }

        let mut members = HashSet::new();
        for member in &group.devices {
            if !devices.contains(member.as_str()) {
                return Err(SyncError::config_validation(
                    format!("groups[{}].devices", group.name),
                    format!("device '{member}' is not declared in [[devices]]"),
                ));
            }
            if !members.insert(member.as_str()) {
                return Err(SyncError::config_validation(
                    format!("groups[{}].devices", group.name),
                    format!("device '{member}' listed twice"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_engine(blueprint: &ControllerBlueprint) -> Result<(), SyncError> {
    let engine = &blueprint.engine;

    if engine.min_measurements > engine.probes_per_sync {
        return Err(SyncError::config_validation(
            "engine.min_measurements / engine.probes_per_sync",
            format!(
                "min_measurements ({}) must be <= probes_per_sync ({})",
                engine.min_measurements, engine.probes_per_sync
            ),
        ));
    }

    if engine.min_measurements > engine.max_measurements {
        return Err(SyncError::config_validation(
            "engine.min_measurements / engine.max_measurements",
            format!(
                "min_measurements ({}) must be <= max_measurements ({})",
                engine.min_measurements, engine.max_measurements
            ),
        ));
    }

    if engine.min_resync_interval_seconds > engine.sync_interval_seconds {
        return Err(SyncError::config_validation(
            "engine.min_resync_interval_seconds",
            format!(
                "min_resync_interval_seconds ({}) must be <= sync_interval_seconds ({})",
                engine.min_resync_interval_seconds, engine.sync_interval_seconds
            ),
        ));
    }

    Ok(())
}

fn validate_log_level(blueprint: &ControllerBlueprint) -> Result<(), SyncError> {
    let level = blueprint.observability.log_level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(SyncError::config_validation(
            "observability.log_level",
            format!("unknown log level '{level}', expected one of {LOG_LEVELS:?}"),
        ));
    }
    Ok(())
}
