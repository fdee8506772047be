//! `calibrate` command implementation.

use anyhow::{Context, Result};
use contracts::{CalibrationAnalysis, CalibrationPlan};
use tracing::info;

use crate::cli::CalibrateArgs;
use crate::commands::load_blueprint;
use crate::fleet::Fleet;

/// Execute the `calibrate` command
pub async fn run_calibrate(args: &CalibrateArgs) -> Result<()> {
    let mut blueprint = load_blueprint(&args.config)?;
    if let Some(seed) = args.seed {
        blueprint.engine.rng_seed = Some(seed);
    }

    let fleet = Fleet::build(&blueprint)?;
    if !args.no_sync {
        let synchronized = fleet.sync_all().await;
        info!(
            synchronized,
            devices = fleet.devices.len(),
            "Fleet synchronized before calibration"
        );
    }

    let result = if args.quick {
        fleet
            .calibration
            .run_quick_calibration_check(&fleet.devices)
            .await
    } else {
        let settings = &blueprint.calibration;
        let plan = CalibrationPlan {
            num_events: args.events.unwrap_or(settings.num_events),
            interval_seconds: settings.interval_seconds,
            kind: settings.kind,
        };
        match fleet
            .calibration
            .start_calibration_session(&fleet.devices, plan)
            .await
        {
            Ok(session) => Ok(fleet.calibration.analyze_calibration_results(&session)),
            Err(e) => Err(e),
        }
    };
    fleet.shutdown().await;
    let analysis = result.context("Calibration failed")?;

    if args.json {
        let json = serde_json::to_string_pretty(&analysis)
            .context("Failed to serialize calibration analysis")?;
        println!("{}", json);
    } else {
        print_analysis(&analysis);
    }
    Ok(())
}

fn ms(value: Option<f64>) -> String {
    value.map_or("-".to_string(), |v| format!("{:.2} ms", v * 1000.0))
}

fn print_analysis(analysis: &CalibrationAnalysis) {
    println!("\n=== Calibration Analysis ===\n");
    println!("Session: {}", analysis.session_id);
    println!("Assessment: {}", analysis.assessment);
    println!(
        "Events: {} ({} with detections)",
        analysis.total_events, analysis.responsive_events
    );
    println!(
        "Error: mean {}, p95 {}, max {}",
        ms(analysis.mean_error),
        ms(analysis.p95_error),
        ms(analysis.max_error)
    );
    if let Some(confidence) = analysis.mean_confidence {
        println!("Mean confidence: {confidence:.2}");
    }

    println!("\nDevices:");
    for device in analysis.devices.values() {
        println!(
            "  - {:<16} delay {:>9}  response {:>4.0}%  confidence {:.2}  rtt ±{}",
            &*device.device_id,
            ms(Some(device.average_delay)),
            device.response_rate * 100.0,
            device.average_confidence,
            ms(device.rtt_uncertainty)
        );
    }

    println!("\nRecommendations:");
    for recommendation in &analysis.recommendations {
        println!("  - {recommendation}");
    }
    println!();
}
