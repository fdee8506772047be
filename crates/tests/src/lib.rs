//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 配置到控制器的端到端流程（模拟传输，无需真实设备）
//! - 组件之间的通知与指标衔接

#[cfg(test)]
mod contract_tests {
    use contracts::{ConfigVersion, ControllerBlueprint};

    #[test]
    fn test_blueprint_version_survives_serde() {
        let json = serde_json::to_string(&ConfigVersion::V1).unwrap();
        assert_eq!(serde_json::from_str::<ConfigVersion>(&json).unwrap(), ConfigVersion::V1);

        let parsed: ControllerBlueprint =
            serde_json::from_str(r#"{ "devices": [{ "id": "cam-a" }] }"#).unwrap();
        assert_eq!(parsed.version, ConfigVersion::default());
        assert_eq!(parsed.devices[0].id, "cam-a");
        assert!(serde_json::from_str::<ConfigVersion>(r#""V9""#).is_err());
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use calibration::CalibrationEngine;
    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{
        CalibrationAssessment, CalibrationPlan, ControllerBlueprint, CoordinationQuality,
        DeviceId, MonotonicClock, SharedClock, SyncState,
    };
    use coordination::{EventCoordinator, MultiDeviceCoordinator, SyncEventKind};
    use observability::SyncMetricsAggregator;
    use sync_engine::{SyncNotification, TimeSyncEngine};
    use transport::SimulatedTransport;

    const RIG_CONFIG: &str = r#"
[engine]
rng_seed = 7
default_event_timeout_seconds = 2.0

[[devices]]
id = "cam-a"
simulation = { clock_offset_ms = 5.0, latency_ms = 4.0, latency_jitter_ms = 0.0, detection_jitter_ms = 0.0 }

[[devices]]
id = "cam-b"
simulation = { clock_offset_ms = 8.0, latency_ms = 4.0, latency_jitter_ms = 0.0, detection_jitter_ms = 0.0 }

[[devices]]
id = "cam-c"
simulation = { clock_offset_ms = 40.0, latency_ms = 4.0, latency_jitter_ms = 0.0, detection_jitter_ms = 0.0 }

[[groups]]
name = "rig"
devices = ["cam-a", "cam-b", "cam-c"]

[calibration]
num_events = 3
interval_seconds = 0.5
kind = "light_pulse"
"#;

    struct Controller {
        transport: Arc<SimulatedTransport>,
        engine: TimeSyncEngine<SimulatedTransport>,
        events: EventCoordinator<SimulatedTransport>,
        groups: MultiDeviceCoordinator<SimulatedTransport>,
        calibration: CalibrationEngine<SimulatedTransport>,
        devices: Vec<DeviceId>,
    }

    fn build(blueprint: &ControllerBlueprint) -> Controller {
        let clock: SharedClock = Arc::new(MonotonicClock::new(10_000.0));
        let transport = Arc::new(SimulatedTransport::new(
            clock.clone(),
            blueprint.engine.rng_seed,
        ));
        let engine = TimeSyncEngine::new(transport.clone(), clock, blueprint.engine.clone());
        let mut devices = Vec::new();
        for device in &blueprint.devices {
            transport.add_device(device.id.as_str(), device.simulation.clone());
            engine.register_device(device.id.as_str());
            devices.push(DeviceId::from(device.id.as_str()));
        }

        let events = EventCoordinator::for_engine(&engine);
        let groups = MultiDeviceCoordinator::new(engine.clone());
        for group in &blueprint.groups {
            groups
                .create_group(group.name.as_str(), group.devices.iter().map(String::as_str))
                .unwrap();
        }
        let calibration = CalibrationEngine::new(engine.clone());

        Controller {
            transport,
            engine,
            events,
            groups,
            calibration,
            devices,
        }
    }

    fn rig() -> Controller {
        let blueprint = ConfigLoader::load_from_str(RIG_CONFIG, ConfigFormat::Toml).unwrap();
        build(&blueprint)
    }

    /// Config -> sync -> group -> recording -> calibration
    #[tokio::test(start_paused = true)]
    async fn test_e2e_recording_session() {
        let blueprint = ConfigLoader::load_from_str(RIG_CONFIG, ConfigFormat::Toml).unwrap();
        let controller = build(&blueprint);

        for device_id in &controller.devices {
            controller.engine.sync_device(device_id, None).await.unwrap();
        }
        assert_eq!(controller.engine.synchronized_devices().len(), 3);
        let offset_c = controller.engine.device_offset("cam-c").unwrap();
        assert!((offset_c - 0.040).abs() < 1e-6, "offset {offset_c}");

        let report = controller.groups.coordinate_group_sync("rig").await.unwrap();
        assert!(report.all_synchronized());
        assert_eq!(report.quality, CoordinationQuality::Fair);
        assert_eq!(report.coordinator, Some(DeviceId::from("cam-a")));

        let event_id = controller
            .events
            .broadcast_recording_start(&controller.devices, Some("take-1"))
            .await
            .unwrap();
        let status = controller.events.event_status(&event_id).unwrap();
        assert!(status.is_successful());
        assert_eq!(status.response_rate(), 1.0);
        assert!(!status.timed_out);
        for device_id in &controller.devices {
            assert_eq!(controller.transport.events_received(device_id), 1);
        }

        // Synchronized devices see the trigger at the same corrected time
        let settings = &blueprint.calibration;
        let plan = CalibrationPlan {
            num_events: settings.num_events,
            interval_seconds: settings.interval_seconds,
            kind: settings.kind,
        };
        let session = controller
            .calibration
            .start_calibration_session(&controller.devices, plan)
            .await
            .unwrap();
        assert_eq!(session.events.len(), 3);
        let analysis = controller.calibration.analyze_calibration_results(&session);
        assert_eq!(analysis.assessment, CalibrationAssessment::Excellent);
        assert!(analysis.mean_error.unwrap() < 1e-6);
        assert_eq!(analysis.devices.len(), 3);

        controller
            .events
            .broadcast_recording_stop(&controller.devices)
            .await
            .unwrap();
        let stats = controller.events.statistics();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.success_rate, 1.0);

        controller.events.shutdown().await;
        controller.engine.shutdown().await;
    }

    /// One camera drops off the network mid-session
    #[tokio::test(start_paused = true)]
    async fn test_e2e_device_outage() {
        let controller = rig();
        for device_id in &controller.devices {
            controller.engine.sync_device(device_id, None).await.unwrap();
        }

        controller.transport.set_online("cam-c", false);
        assert!(controller.engine.sync_device("cam-c", None).await.is_err());
        assert_eq!(
            controller.engine.get_sync_status("cam-c").unwrap().state,
            SyncState::NetworkError
        );
        assert!(controller.engine.failure_info("cam-c").is_some());

        let event_id = controller
            .events
            .broadcast_sync_marker(&controller.devices, "outage")
            .await
            .unwrap();
        let status = controller.events.event_status(&event_id).unwrap();
        assert!(status.timed_out);
        assert!((status.response_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(status.missing_devices(), vec![DeviceId::from("cam-c")]);

        let report = controller.groups.coordinate_group_sync("rig").await.unwrap();
        assert!(!report.all_synchronized());
        assert!(report.failed.contains(&DeviceId::from("cam-c")));
        assert!(report.success_rate < 1.0);

        controller.engine.shutdown().await;
        controller.events.shutdown().await;
    }

    /// Engine notifications feed the run metrics
    #[tokio::test(start_paused = true)]
    async fn test_e2e_notifications_feed_metrics() {
        let controller = rig();
        let metrics = Arc::new(Mutex::new(SyncMetricsAggregator::new()));
        let sink = Arc::clone(&metrics);
        controller
            .engine
            .subscribe(Arc::new(move |note: &SyncNotification| {
                let mut metrics = sink.lock().unwrap();
                match note {
                    SyncNotification::Synchronized {
                        device_id,
                        offset,
                        uncertainty,
                        ..
                    } => metrics.record_sync_success(device_id, *offset, *uncertainty),
                    SyncNotification::NetworkFailure { .. } => metrics.record_sync_failure(true),
                    _ => {}
                }
            }));

        for device_id in &controller.devices {
            controller.engine.sync_device(device_id, None).await.unwrap();
        }
        controller.transport.set_online("cam-b", false);
        let _ = controller.engine.sync_device("cam-b", None).await;
        controller.engine.shutdown().await;

        let summary = metrics.lock().unwrap().summary();
        assert_eq!(summary.sync_successes, 3);
        assert!(summary.network_failures >= 1);
        assert!(summary.device_offsets_ms.contains_key("cam-c"));
    }

    /// Heartbeats keep flowing while auto-sync runs in the background
    #[tokio::test(start_paused = true)]
    async fn test_e2e_background_loops() {
        let controller = rig();
        assert!(controller.engine.start_auto_sync());
        assert!(controller.events.start_heartbeat(controller.devices.clone()));

        let heartbeat = controller.engine.config().heartbeat_interval_seconds;
        tokio::time::sleep(Duration::from_secs_f64(heartbeat * 2.5)).await;

        assert_eq!(controller.engine.synchronized_devices().len(), 3);
        let history = controller.events.event_history();
        assert!(history.len() >= 2);
        assert!(history
            .iter()
            .all(|status| status.event.event_type == SyncEventKind::Heartbeat && status.is_successful()));

        controller.events.shutdown().await;
        controller.engine.shutdown().await;
        assert!(!controller.events.is_heartbeat_running());
        assert!(!controller.engine.is_auto_sync_running());
    }

    #[test]
    fn test_group_with_unknown_device_rejected() {
        let config = r#"
[[devices]]
id = "cam-a"

[[groups]]
name = "rig"
devices = ["cam-a", "ghost"]
"#;
        assert!(ConfigLoader::load_from_str(config, ConfigFormat::Toml).is_err());
    }
}
