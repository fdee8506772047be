//! `run` command implementation.

use std::sync::PoisonError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use coordination::{EventStatistics, GroupSyncReport};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::commands::load_blueprint;
use crate::fleet::Fleet;

/// Execute the `run` command
pub async fn run_controller(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");
    let mut blueprint = load_blueprint(&args.config)?;

    if let Some(port) = args.metrics_port {
        blueprint.observability.metrics_port = (port != 0).then_some(port);
    }
    if let Some(seed) = args.seed {
        info!(seed, "Overriding RNG seed from CLI");
        blueprint.engine.rng_seed = Some(seed);
    }
    if let Some(port) = blueprint.observability.metrics_port {
        observability::init_metrics_only(port)?;
        info!("Metrics endpoint available on port {}", port);
    }

    let run_for = if args.duration > 0.0 {
        Some(Duration::try_from_secs_f64(args.duration).context("Invalid --duration")?)
    } else {
        None
    };

    let started = Instant::now();
    let fleet = Fleet::build(&blueprint)?;

    let synchronized = fleet.sync_all().await;
    info!(
        synchronized,
        devices = fleet.devices.len(),
        "Initial synchronization finished"
    );

    let mut group_reports = Vec::new();
    for (name, _) in fleet.groups.groups() {
        match fleet.groups.coordinate_group_sync(&name).await {
            Ok(report) => group_reports.push(report),
            Err(e) => warn!(group = %name, error = %e, "group sync failed"),
        }
    }

    fleet.engine.start_auto_sync();
    fleet.events.start_heartbeat(fleet.devices.clone());

    if !fleet.devices.is_empty() {
        fleet
            .events
            .broadcast_recording_start(&fleet.devices, Some(args.session_name.as_str()))
            .await
            .context("Failed to broadcast recording start")?;
    }

    info!("Controller running, press Ctrl+C to stop");
    tokio::select! {
        _ = wait_for(run_for) => info!("Run duration elapsed"),
        _ = shutdown_signal() => warn!("Received shutdown signal, stopping controller..."),
    }

    if !fleet.devices.is_empty() {
        if let Err(e) = fleet.events.broadcast_recording_stop(&fleet.devices).await {
            warn!(error = %e, "recording stop broadcast failed");
        }
    }

    fleet.shutdown().await;
    fleet.collect_event_metrics();
    print_summary(&fleet, &group_reports, &fleet.events.statistics(), started.elapsed());

    info!("Syncline finished");
    Ok(())
}

async fn wait_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_summary(
    fleet: &Fleet,
    groups: &[GroupSyncReport],
    events: &EventStatistics,
    elapsed: Duration,
) {
    println!("\n=== Syncline Run Summary ===\n");
    println!("Duration: {:.1}s", elapsed.as_secs_f64());

    println!("\nDevices ({}):", fleet.devices.len());
    for status in fleet.engine.all_statuses() {
        let offset = status
            .offset
            .map_or("-".to_string(), |o| format!("{:+.3} ms", o * 1000.0));
        let uncertainty = status
            .uncertainty
            .map_or("-".to_string(), |u| format!("±{:.3} ms", u * 1000.0));
        println!(
            "  - {:<16} {:<14} offset {:>12} {:>12}  success {:.0}%",
            &*status.device_id,
            status.state.as_str(),
            offset,
            uncertainty,
            status.success_rate() * 100.0
        );
    }

    if !groups.is_empty() {
        println!("\nGroups:");
        for report in groups {
            let spread = report
                .spread_ms()
                .map_or("-".to_string(), |s| format!("{s:.2} ms"));
            println!(
                "  - {}: {} ({}/{} synchronized, spread {}, success {:.0}%)",
                report.group,
                report.quality,
                report.synchronized.len(),
                report.results.len(),
                spread,
                report.success_rate * 100.0
            );
        }
    }

    println!("\nEvents:");
    println!("  Broadcast: {}", events.total_events);
    println!("  Success rate: {:.1}%", events.success_rate * 100.0);
    println!("  Mean quality: {:.3}", events.average_quality);
    println!("  Mean response rate: {:.3}", events.average_response_rate);

    let transport = fleet.transport.stats();
    println!(
        "\nTransport: {} probes ({} failed), {} events ({} failed), {} detections",
        transport.probes_sent,
        transport.probes_failed,
        transport.events_sent,
        transport.events_failed,
        transport.detections_requested
    );

    let summary = fleet
        .metrics
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .summary();
    println!("\n{summary}");
}
