//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{ControllerBlueprint, EngineConfig, SimulationProfile};
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;
use crate::commands::load_blueprint;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo<'a> {
    version: String,
    engine: &'a EngineConfig,
    devices: Vec<DeviceInfo<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    groups: Vec<GroupInfo<'a>>,
    calibration: CalibrationInfo,
    metrics_port: Option<u16>,
}

#[derive(Serialize)]
struct DeviceInfo<'a> {
    id: &'a str,
    groups: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<&'a SimulationProfile>,
}

#[derive(Serialize)]
struct GroupInfo<'a> {
    name: &'a str,
    devices: &'a [String],
}

#[derive(Serialize)]
struct CalibrationInfo {
    num_events: usize,
    interval_seconds: f64,
    kind: String,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");
    let blueprint = load_blueprint(&args.config)?;

    if args.json {
        let info = build_config_info(&blueprint, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args);
    }

    Ok(())
}

fn groups_of<'a>(blueprint: &'a ControllerBlueprint, device_id: &str) -> Vec<&'a str> {
    blueprint
        .groups
        .iter()
        .filter(|g| g.devices.iter().any(|d| d == device_id))
        .map(|g| g.name.as_str())
        .collect()
}

fn build_config_info<'a>(blueprint: &'a ControllerBlueprint, args: &InfoArgs) -> ConfigInfo<'a> {
    let devices = blueprint
        .devices
        .iter()
        .map(|d| DeviceInfo {
            id: &d.id,
            groups: groups_of(blueprint, &d.id),
            simulation: args.devices.then_some(&d.simulation),
        })
        .collect();

    let groups = blueprint
        .groups
        .iter()
        .map(|g| GroupInfo {
            name: &g.name,
            devices: &g.devices,
        })
        .collect();

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        engine: &blueprint.engine,
        devices,
        groups,
        calibration: CalibrationInfo {
            num_events: blueprint.calibration.num_events,
            interval_seconds: blueprint.calibration.interval_seconds,
            kind: format!("{:?}", blueprint.calibration.kind),
        },
        metrics_port: blueprint.observability.metrics_port,
    }
}

fn print_config_info(blueprint: &ControllerBlueprint, args: &InfoArgs) {
    let engine = &blueprint.engine;

    println!("=== Syncline Configuration ===\n");
    println!("Version: {:?}", blueprint.version);

    println!("\nEngine");
    println!("   ├─ Sync interval: {}s", engine.sync_interval_seconds);
    println!(
        "   ├─ Probes per sync: {} (min {} surviving, {}σ outlier cut)",
        engine.probes_per_sync, engine.min_measurements, engine.outlier_stddev_multiplier
    );
    println!(
        "   ├─ Max uncertainty: {} ms",
        engine.max_uncertainty_seconds * 1000.0
    );
    println!(
        "   ├─ Recovery: {} attempts, backoff cap {}s",
        engine.max_recovery_attempts, engine.max_backoff_seconds
    );
    println!("   ├─ Heartbeat: every {}s", engine.heartbeat_interval_seconds);
    println!(
        "   └─ Event timeout: {}s (history {})",
        engine.default_event_timeout_seconds, engine.event_history_size
    );

    println!("\nDevices ({})", blueprint.devices.len());
    for (i, device) in blueprint.devices.iter().enumerate() {
        let is_last = i == blueprint.devices.len() - 1;
        let prefix = if is_last { "└─" } else { "├─" };
        let child_prefix = if is_last { "   " } else { "│  " };
        let groups = groups_of(blueprint, &device.id);

        if groups.is_empty() {
            println!("   {} {}", prefix, device.id);
        } else {
            println!("   {} {} [{}]", prefix, device.id, groups.join(", "));
        }

        if args.devices {
            let sim = &device.simulation;
            println!(
                "   {}  └─ offset {} ms, latency {}±{} ms, drop {:.0}%, {}",
                child_prefix,
                sim.clock_offset_ms,
                sim.latency_ms,
                sim.latency_jitter_ms,
                sim.drop_rate * 100.0,
                if sim.online { "online" } else { "offline" }
            );
        }
    }

    if !blueprint.groups.is_empty() {
        println!("\nGroups ({})", blueprint.groups.len());
        for (i, group) in blueprint.groups.iter().enumerate() {
            let prefix = if i == blueprint.groups.len() - 1 { "└─" } else { "├─" };
            println!("   {} {}: {}", prefix, group.name, group.devices.join(", "));
        }
    }

    let calibration = &blueprint.calibration;
    println!("\nCalibration");
    println!(
        "   └─ {} x {:?} every {}s",
        calibration.num_events, calibration.kind, calibration.interval_seconds
    );

    println!();
}
