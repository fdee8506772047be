//! # Observability
//!
//! 同步控制器的日志与指标。
//!
//! - `tracing` 订阅器：JSON / Pretty / Compact 三种输出，写到 stderr，
//!   `RUST_LOG` 优先于配置的默认级别
//! - Prometheus 导出端点（可选）
//! - 同步、事件广播、组协调、校准的指标记录函数与本地聚合器
//!
//! ```ignore
//! observability::init_with_config(ObservabilityConfig {
//!     log_format: LogFormat::Compact,
//!     metrics_port: Some(9000),
//!     default_log_level: "debug".into(),
//! })?;
//! observability::record_sync_success(&device_id, offset, uncertainty, quality);
//! ```

pub mod metrics;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use crate::metrics::{
    record_calibration_event, record_calibration_session, record_device_counts,
    record_event_broadcast, record_group_sync, record_permanent_failure,
    record_recovery_attempt, record_state_transition, record_sync_failure, record_sync_rejected,
    record_sync_success, MetricsSummary, RunningStats, StatsSummary, SyncMetricsAggregator,
};

/// 日志与指标端点设置
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Prometheus 端口，`None` 表示不导出
    pub metrics_port: Option<u16>,
    /// 未设置 `RUST_LOG` 时使用的过滤指令
    pub default_log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            metrics_port: None,
            default_log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// 每行一个 JSON 对象，带当前 span
    Json,
    Pretty,
    #[default]
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }

    fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    {
        let base = fmt::layer().with_writer(std::io::stderr);
        match self {
            Self::Json => base
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
            Self::Pretty => base.pretty().with_file(true).with_line_number(true).boxed(),
            Self::Compact => base.compact().with_target(false).boxed(),
        }
    }
}

/// Install the global subscriber, then the exporter if a port is set.
///
/// Fails if a global subscriber is already installed.
pub fn init_with_config(config: ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_log_level))
        .with_context(|| format!("Invalid log filter '{}'", config.default_log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(config.log_format.layer())
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    if let Some(port) = config.metrics_port {
        init_metrics_only(port)?;
    }

    tracing::debug!(
        log_format = ?config.log_format,
        metrics_port = ?config.metrics_port,
        "Observability initialized"
    );
    Ok(())
}

/// Install the Prometheus recorder and its HTTP listener on `port`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics_only(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on port {port}"))?;

    tracing::info!(port, "Prometheus metrics endpoint listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_log_compact_without_exporter() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.default_log_level, "info");
        assert_eq!(config.log_format, LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }
}
