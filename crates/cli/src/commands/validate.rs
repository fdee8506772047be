//! `validate` command implementation.

use std::collections::HashSet;

use anyhow::{Context, Result};
use contracts::ControllerBlueprint;
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    device_count: usize,
    group_count: usize,
    sync_interval_seconds: f64,
    max_uncertainty_ms: f64,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: Vec::new(),
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => ValidationResult {
            valid: true,
            config_path,
            error: None,
            warnings: collect_warnings(&blueprint),
            summary: Some(ConfigSummary {
                version: format!("{:?}", blueprint.version),
                device_count: blueprint.devices.len(),
                group_count: blueprint.groups.len(),
                sync_interval_seconds: blueprint.engine.sync_interval_seconds,
                max_uncertainty_ms: blueprint.engine.max_uncertainty_seconds * 1000.0,
            }),
        },
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: Vec::new(),
            summary: None,
        },
    }
}

/// Non-fatal configuration issues
fn collect_warnings(blueprint: &ControllerBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();
    let engine = &blueprint.engine;

    if blueprint.devices.is_empty() {
        warnings.push("No devices configured - nothing will be synchronized".to_string());
    }

    let grouped: HashSet<&str> = blueprint
        .groups
        .iter()
        .flat_map(|g| g.devices.iter().map(String::as_str))
        .collect();
    if !blueprint.groups.is_empty() {
        for device in &blueprint.devices {
            if !grouped.contains(device.id.as_str()) {
                warnings.push(format!("Device '{}' is not in any group", device.id));
            }
        }
    }

    for device in &blueprint.devices {
        if !device.simulation.online {
            warnings.push(format!("Device '{}' starts offline", device.id));
        }
    }

    if engine.heartbeat_interval_seconds > engine.sync_interval_seconds {
        warnings.push(format!(
            "heartbeat_interval_seconds ({}) exceeds sync_interval_seconds ({})",
            engine.heartbeat_interval_seconds, engine.sync_interval_seconds
        ));
    }

    if engine.probe_timeout_seconds >= engine.default_event_timeout_seconds {
        warnings.push(
            "probe_timeout_seconds is not shorter than default_event_timeout_seconds".to_string(),
        );
    }

    if engine.min_confidence_threshold < 0.5 {
        warnings.push(format!(
            "min_confidence_threshold {} accepts unreliable detections",
            engine.min_confidence_threshold
        ));
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Devices: {}", summary.device_count);
            println!("  Groups: {}", summary.group_count);
            println!("  Sync interval: {}s", summary.sync_interval_seconds);
            println!("  Max uncertainty: {} ms", summary.max_uncertainty_ms);
        }

        if !result.warnings.is_empty() {
            println!("\n⚠ Warnings:");
            for warning in &result.warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
