//! 同步指标收集模块
//!
//! 记录时钟同步、恢复、事件广播与校准的运行指标。

use std::collections::HashMap;

use contracts::{SyncEventStatus, SyncState};
use metrics::{counter, gauge, histogram};

/// 记录一次成功的时钟估计
pub fn record_sync_success(device_id: &str, offset_s: f64, uncertainty_s: f64, quality: f64) {
    counter!(
        "syncline_sync_attempts_total",
        "device_id" => device_id.to_string(),
        "outcome" => "success"
    )
    .increment(1);

    gauge!("syncline_device_offset_ms", "device_id" => device_id.to_string())
        .set(offset_s * 1000.0);
    gauge!("syncline_device_uncertainty_ms", "device_id" => device_id.to_string())
        .set(uncertainty_s * 1000.0);
    histogram!("syncline_sync_uncertainty_ms").record(uncertainty_s * 1000.0);
    histogram!("syncline_sync_quality").record(quality);
}

/// 记录一次失败的同步
///
/// `reason`: insufficient_measurements / uncertainty_too_high / transport / cancelled
pub fn record_sync_failure(device_id: &str, reason: &'static str) {
    counter!(
        "syncline_sync_attempts_total",
        "device_id" => device_id.to_string(),
        "outcome" => reason
    )
    .increment(1);
}

/// 记录被拒绝的重复同步请求
pub fn record_sync_rejected(device_id: &str) {
    counter!(
        "syncline_sync_rejected_total",
        "device_id" => device_id.to_string()
    )
    .increment(1);
}

pub fn record_state_transition(from: SyncState, to: SyncState) {
    counter!(
        "syncline_state_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// 记录恢复尝试
pub fn record_recovery_attempt(device_id: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "syncline_recovery_attempts_total",
        "device_id" => device_id.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_permanent_failure(device_id: &str) {
    counter!(
        "syncline_permanent_failures_total",
        "device_id" => device_id.to_string()
    )
    .increment(1);
}

/// 记录设备数量
pub fn record_device_counts(registered: usize, synchronized: usize) {
    gauge!("syncline_devices_registered").set(registered as f64);
    gauge!("syncline_devices_synchronized").set(synchronized as f64);
}

/// 记录事件广播结果 (事件移入历史时调用)
pub fn record_event_broadcast(status: &SyncEventStatus) {
    let outcome = if status.is_successful() {
        "success"
    } else if status.timed_out {
        "timeout"
    } else {
        "error"
    };
    counter!(
        "syncline_event_broadcasts_total",
        "event_type" => status.event.event_type.as_str(),
        "outcome" => outcome
    )
    .increment(1);

    histogram!("syncline_event_quality").record(status.quality());
    histogram!("syncline_event_response_rate").record(status.response_rate());
    if let Some(delay) = status.max_processing_delay_ms() {
        histogram!("syncline_event_processing_delay_ms").record(delay);
    }
}

/// 记录分组同步结果
pub fn record_group_sync(group: &str, spread_s: Option<f64>, success_rate: f64) {
    counter!("syncline_group_syncs_total", "group" => group.to_string()).increment(1);
    if let Some(spread) = spread_s {
        gauge!("syncline_group_spread_ms", "group" => group.to_string()).set(spread * 1000.0);
    }
    gauge!("syncline_group_success_rate", "group" => group.to_string()).set(success_rate);
}

/// 记录单个校准事件
pub fn record_calibration_event(sync_error_s: Option<f64>, responses: usize) {
    counter!("syncline_calibration_events_total").increment(1);
    histogram!("syncline_calibration_responses").record(responses as f64);
    if let Some(error) = sync_error_s {
        histogram!("syncline_calibration_error_ms").record(error * 1000.0);
    }
}

pub fn record_calibration_session(assessment: &'static str, mean_error_s: Option<f64>) {
    counter!("syncline_calibration_sessions_total", "assessment" => assessment).increment(1);
    if let Some(error) = mean_error_s {
        gauge!("syncline_calibration_mean_error_ms").set(error * 1000.0);
    }
}

/// 同步指标聚合器
///
/// 在内存中聚合指标，便于统计和输出摘要。
#[derive(Debug, Clone, Default)]
pub struct SyncMetricsAggregator {
    pub sync_successes: u64,
    pub sync_failures: u64,
    /// 其中由传输失败导致的次数
    pub network_failures: u64,
    pub recoveries: u64,
    pub failed_recoveries: u64,
    pub permanent_failures: u64,

    pub events_broadcast: u64,
    pub events_successful: u64,
    pub events_timed_out: u64,

    /// 不确定度统计 (毫秒)
    pub uncertainty_stats: RunningStats,
    pub event_quality_stats: RunningStats,
    pub response_rate_stats: RunningStats,

    /// 各设备偏移统计 (毫秒)
    pub offset_stats: HashMap<String, RunningStats>,
}

impl SyncMetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sync_success(&mut self, device_id: &str, offset_s: f64, uncertainty_s: f64) {
        self.sync_successes += 1;
        self.uncertainty_stats.push(uncertainty_s * 1000.0);
        self.offset_stats
            .entry(device_id.to_string())
            .or_default()
            .push(offset_s * 1000.0);
    }

    pub fn record_sync_failure(&mut self, network: bool) {
        self.sync_failures += 1;
        if network {
            self.network_failures += 1;
        }
    }

    pub fn record_recovery(&mut self, success: bool) {
        if success {
            self.recoveries += 1;
        } else {
            self.failed_recoveries += 1;
        }
    }

    pub fn record_permanent_failure(&mut self) {
        self.permanent_failures += 1;
    }

    pub fn record_event(&mut self, status: &SyncEventStatus) {
        self.events_broadcast += 1;
        if status.is_successful() {
            self.events_successful += 1;
        }
        if status.timed_out {
            self.events_timed_out += 1;
        }
        self.event_quality_stats.push(status.quality());
        self.response_rate_stats.push(status.response_rate());
    }

    /// 生成摘要报告
    pub fn summary(&self) -> MetricsSummary {
        let attempts = self.sync_successes + self.sync_failures;
        MetricsSummary {
            sync_attempts: attempts,
            sync_successes: self.sync_successes,
            sync_success_rate: percent(self.sync_successes, attempts),
            network_failures: self.network_failures,
            recoveries: self.recoveries,
            failed_recoveries: self.failed_recoveries,
            permanent_failures: self.permanent_failures,
            events_broadcast: self.events_broadcast,
            event_success_rate: percent(self.events_successful, self.events_broadcast),
            events_timed_out: self.events_timed_out,
            uncertainty_ms: StatsSummary::from(&self.uncertainty_stats),
            event_quality: StatsSummary::from(&self.event_quality_stats),
            response_rate: StatsSummary::from(&self.response_rate_stats),
            device_offsets_ms: self
                .offset_stats
                .iter()
                .map(|(id, stats)| (id.clone(), StatsSummary::from(stats)))
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total > 0 {
        part as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

/// 指标摘要
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub sync_attempts: u64,
    pub sync_successes: u64,
    pub sync_success_rate: f64,
    pub network_failures: u64,
    pub recoveries: u64,
    pub failed_recoveries: u64,
    pub permanent_failures: u64,
    pub events_broadcast: u64,
    pub event_success_rate: f64,
    pub events_timed_out: u64,
    pub uncertainty_ms: StatsSummary,
    pub event_quality: StatsSummary,
    pub response_rate: StatsSummary,
    pub device_offsets_ms: HashMap<String, StatsSummary>,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Sync Metrics Summary ===")?;
        writeln!(
            f,
            "Sync attempts: {} ({} ok, {:.2}%)",
            self.sync_attempts, self.sync_successes, self.sync_success_rate
        )?;
        writeln!(f, "Network failures: {}", self.network_failures)?;
        writeln!(
            f,
            "Recoveries: {} ok, {} failed, {} permanent failures",
            self.recoveries, self.failed_recoveries, self.permanent_failures
        )?;
        writeln!(
            f,
            "Events broadcast: {} ({:.2}% successful, {} timed out)",
            self.events_broadcast, self.event_success_rate, self.events_timed_out
        )?;
        writeln!(f, "Uncertainty (ms): {}", self.uncertainty_ms)?;
        writeln!(f, "Event quality: {}", self.event_quality)?;
        writeln!(f, "Response rate: {}", self.response_rate)?;

        if !self.device_offsets_ms.is_empty() {
            writeln!(f, "Device offsets (ms):")?;
            let mut devices: Vec<_> = self.device_offsets_ms.iter().collect();
            devices.sort_by(|a, b| a.0.cmp(b.0));
            for (device, stats) in devices {
                writeln!(f, "  {}: {}", device, stats)?;
            }
        }

        Ok(())
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (value - self.mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 样本方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{
        DeviceEventResponse, DeviceId, EventPayload, EventPriority, ResponseStatus, SyncEvent,
        SyncEventKind,
    };
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn event_status(responders: &[&str], targets: &[&str]) -> SyncEventStatus {
        let event = SyncEvent {
            event_id: "e1".into(),
            event_type: SyncEventKind::SyncMarker,
            timestamp: 0.0,
            priority: EventPriority::Normal,
            data: EventPayload::new(),
            description: String::new(),
            source_device: "controller".into(),
        };
        let targets: BTreeSet<DeviceId> = targets.iter().map(|t| DeviceId::from(*t)).collect();
        let mut status = SyncEventStatus::new(event, 0.0, targets, Duration::from_secs(1));
        for id in responders {
            status.record_response(DeviceEventResponse {
                device_id: (*id).into(),
                event_id: "e1".into(),
                received_timestamp: 10.0,
                processed_timestamp: 12.0,
                local_timestamp: 12.0,
                status: ResponseStatus::Acknowledged,
                error_message: None,
            });
        }
        status
    }

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stats.push(value);
        }

        assert_eq!(stats.count(), 5);
        assert!((stats.mean() - 3.0).abs() < 1e-10);
        assert!((stats.min() - 1.0).abs() < 1e-10);
        assert!((stats.max() - 5.0).abs() < 1e-10);
        assert!((stats.variance() - 2.5).abs() < 1e-10);
    }

    #[test]
    fn test_aggregator_sync_counts() {
        let mut aggregator = SyncMetricsAggregator::new();
        aggregator.record_sync_success("d1", 0.010, 0.002);
        aggregator.record_sync_success("d1", 0.012, 0.004);
        aggregator.record_sync_failure(true);
        aggregator.record_recovery(false);
        aggregator.record_permanent_failure();

        let summary = aggregator.summary();
        assert_eq!(summary.sync_attempts, 3);
        assert_eq!(summary.network_failures, 1);
        assert!((summary.sync_success_rate - 66.666).abs() < 0.01);
        assert!((summary.device_offsets_ms["d1"].mean - 11.0).abs() < 1e-9);
        assert!((summary.uncertainty_ms.max - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregator_events() {
        let mut aggregator = SyncMetricsAggregator::new();
        aggregator.record_event(&event_status(&["a", "b"], &["a", "b"]));
        aggregator.record_event(&event_status(&["a"], &["a", "b"]));

        let summary = aggregator.summary();
        assert_eq!(summary.events_broadcast, 2);
        assert!((summary.event_success_rate - 50.0).abs() < 1e-9);
        assert!((summary.response_rate.mean - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_summary_display() {
        let mut aggregator = SyncMetricsAggregator::new();
        aggregator.record_sync_success("phone", 0.005, 0.001);
        let output = format!("{}", aggregator.summary());
        assert!(output.contains("Sync attempts: 1 (1 ok, 100.00%)"));
        assert!(output.contains("phone:"));
        assert!(output.contains("Event quality: N/A"));
    }
}
