//! Clock offset estimation from a batch of round-trip probes.

use std::time::Duration;

use contracts::{
    DeviceId, DeviceTransport, EngineConfig, SharedClock, SyncError, TimeSyncMeasurement,
    TransportError,
};
use serde::Serialize;
use tracing::{debug, instrument, trace};

use crate::stats;

/// Batch below which the leave-one-out rule has too few peers
const LEAVE_ONE_OUT_MIN_BATCH: usize = 3;

/// Estimator parameters, usually derived from `EngineConfig`
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorSettings {
    pub probes_per_sync: usize,
    pub probe_spacing: Duration,
    pub probe_timeout: Duration,
    pub min_measurements: usize,
    /// Seconds
    pub max_uncertainty: f64,
    pub outlier_stddev_multiplier: f64,
    /// Seconds
    pub max_acceptable_rtt: f64,
}

impl From<&EngineConfig> for EstimatorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            probes_per_sync: config.probes_per_sync,
            probe_spacing: config.probe_spacing(),
            probe_timeout: config.probe_timeout(),
            min_measurements: config.min_measurements,
            max_uncertainty: config.max_uncertainty_seconds,
            outlier_stddev_multiplier: config.outlier_stddev_multiplier,
            max_acceptable_rtt: config.max_acceptable_rtt_seconds,
        }
    }
}

/// Accepted offset estimate for one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockEstimate {
    pub device_id: DeviceId,
    /// Median of the surviving offsets (seconds)
    pub offset: f64,
    /// Median of the surviving one-way delays (seconds)
    pub uncertainty: f64,
    /// Mean per-probe quality of the survivors
    pub quality: f64,
    pub measurements_used: usize,
    pub measurements_total: usize,
    /// Every collected measurement in arrival order, outliers included
    pub measurements: Vec<TimeSyncMeasurement>,
}

impl ClockEstimate {
    pub fn outliers_rejected(&self) -> usize {
        self.measurements_total - self.measurements_used
    }
}

/// Runs probe batches against a device and aggregates them
pub struct ClockEstimator {
    settings: EstimatorSettings,
    clock: SharedClock,
}

impl ClockEstimator {
    pub fn new(settings: EstimatorSettings, clock: SharedClock) -> Self {
        Self { settings, clock }
    }

    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    /// Single probe bounded by the probe timeout
    pub async fn probe<T>(
        &self,
        transport: &T,
        device_id: &DeviceId,
    ) -> Result<TimeSyncMeasurement, TransportError>
    where
        T: DeviceTransport + Sync,
    {
        let send_time = self.clock.now();
        let device_time =
            match tokio::time::timeout(self.settings.probe_timeout, transport.send_probe(device_id))
                .await
            {
                Ok(reply) => reply?,
                Err(_) => {
                    return Err(TransportError::timeout(format!(
                        "probe timed out after {:.3}s",
                        self.settings.probe_timeout.as_secs_f64()
                    )))
                }
            };
        let receive_time = self.clock.now();

        Ok(TimeSyncMeasurement::from_probe(
            device_id.clone(),
            send_time,
            device_time,
            receive_time,
            self.settings.max_acceptable_rtt,
        ))
    }

    /// Run `probes` sequential probes and aggregate the replies.
    ///
    /// Failed probes are skipped; a batch with no reply at all is a
    /// transport failure.
    #[instrument(
        name = "clock_estimate",
        skip(self, transport),
        fields(device_id = %device_id)
    )]
    pub async fn estimate<T>(
        &self,
        transport: &T,
        device_id: &DeviceId,
        probes: usize,
    ) -> Result<ClockEstimate, SyncError>
    where
        T: DeviceTransport + Sync,
    {
        let probes = probes.max(1);
        let mut collected = Vec::with_capacity(probes);
        let mut last_error = None;

        for index in 0..probes {
            if index > 0 && !self.settings.probe_spacing.is_zero() {
                tokio::time::sleep(self.settings.probe_spacing).await;
            }
            match self.probe(transport, device_id).await {
                Ok(measurement) => {
                    trace!(
                        index,
                        offset_ms = measurement.offset_ms(),
                        rtt_ms = measurement.round_trip_time * 1000.0,
                        "probe answered"
                    );
                    collected.push(measurement);
                }
                Err(e) => {
                    debug!(index, kind = %e.kind, error = %e.message, "probe failed");
                    last_error = Some(e);
                }
            }
        }

        if collected.is_empty() {
            let source = last_error
                .unwrap_or_else(|| TransportError::timeout("no probe reply received"));
            return Err(SyncError::transport(device_id.clone(), source));
        }

        aggregate(device_id, collected, &self.settings)
    }
}

/// Filter outliers and reduce a batch to one estimate.
pub fn aggregate(
    device_id: &DeviceId,
    measurements: Vec<TimeSyncMeasurement>,
    settings: &EstimatorSettings,
) -> Result<ClockEstimate, SyncError> {
    let total = measurements.len();
    let keep = outlier_mask(&measurements, settings.outlier_stddev_multiplier);
    let survivors: Vec<&TimeSyncMeasurement> = measurements
        .iter()
        .zip(&keep)
        .filter_map(|(m, kept)| kept.then_some(m))
        .collect();

    if survivors.len() < settings.min_measurements {
        return Err(SyncError::InsufficientMeasurements {
            device_id: device_id.clone(),
            valid: survivors.len(),
            required: settings.min_measurements,
        });
    }

    let offsets: Vec<f64> = survivors.iter().map(|m| m.offset).collect();
    let delays: Vec<f64> = survivors.iter().map(|m| m.one_way_delay).collect();
    let qualities: Vec<f64> = survivors.iter().map(|m| m.quality).collect();

    let (Some(offset), Some(uncertainty)) = (stats::median(&offsets), stats::median(&delays))
    else {
        return Err(SyncError::InsufficientMeasurements {
            device_id: device_id.clone(),
            valid: 0,
            required: settings.min_measurements.max(1),
        });
    };

    if uncertainty > settings.max_uncertainty {
        return Err(SyncError::UncertaintyTooHigh {
            device_id: device_id.clone(),
            uncertainty_ms: uncertainty * 1000.0,
            max_ms: settings.max_uncertainty * 1000.0,
        });
    }

    let used = survivors.len();
    Ok(ClockEstimate {
        device_id: device_id.clone(),
        offset,
        uncertainty,
        quality: stats::stable_mean(&qualities).unwrap_or(0.0),
        measurements_used: used,
        measurements_total: total,
        measurements,
    })
}

/// Split a batch into (survivors, outliers), preserving order.
pub fn filter_outliers(
    measurements: Vec<TimeSyncMeasurement>,
    multiplier: f64,
) -> (Vec<TimeSyncMeasurement>, Vec<TimeSyncMeasurement>) {
    let keep = outlier_mask(&measurements, multiplier);
    let mut survivors = Vec::with_capacity(measurements.len());
    let mut outliers = Vec::new();
    for (measurement, kept) in measurements.into_iter().zip(keep) {
        if kept {
            survivors.push(measurement);
        } else {
            outliers.push(measurement);
        }
    }
    (survivors, outliers)
}

/// `true` for measurements that survive.
///
/// Each offset is compared against the mean and population standard
/// deviation of the *other* offsets, so a single extreme sample cannot
/// inflate the deviation it is judged by. Anything the whole-batch
/// `|x - mean| > k·σ` rule rejects is rejected here too.
fn outlier_mask(measurements: &[TimeSyncMeasurement], multiplier: f64) -> Vec<bool> {
    let offsets: Vec<f64> = measurements.iter().map(|m| m.offset).collect();

    if offsets.len() < LEAVE_ONE_OUT_MIN_BATCH {
        let (Some(mean), Some(std)) = (stats::mean(&offsets), stats::population_std(&offsets))
        else {
            return Vec::new();
        };
        return offsets
            .iter()
            .map(|o| (o - mean).abs() <= multiplier * std)
            .collect();
    }

    let mut others = Vec::with_capacity(offsets.len() - 1);
    offsets
        .iter()
        .enumerate()
        .map(|(i, offset)| {
            others.clear();
            others.extend(
                offsets
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, o)| *o),
            );
            match (stats::mean(&others), stats::population_std(&others)) {
                (Some(mean), Some(std)) => (offset - mean).abs() <= multiplier * std,
                _ => true,
            }
        })
        .collect()
}
