//! Session analysis: error statistics, assessment and recommendations

use std::collections::BTreeMap;

use contracts::{
    CalibrationAnalysis, CalibrationAssessment, CalibrationMeasurement, CalibrationSession,
    DeviceCalibrationStats, DeviceId,
};
use sync_engine::stats;

/// (max mean error in seconds, min mean confidence) per bucket, best first
const ASSESSMENT_TABLE: [(f64, f64, CalibrationAssessment); 3] = [
    (0.010, 0.9, CalibrationAssessment::Excellent),
    (0.025, 0.8, CalibrationAssessment::Good),
    (0.050, 0.7, CalibrationAssessment::Fair),
];

/// Devices detecting fewer triggers than this are flagged
const LOW_RESPONSE_RATE: f64 = 0.8;
const LOW_CONFIDENCE: f64 = 0.8;
/// Residuals below this never fail the RTT cross-check (seconds)
const CROSS_CHECK_FLOOR_S: f64 = 0.005;

pub fn assess(mean_error: f64, mean_confidence: f64) -> CalibrationAssessment {
    ASSESSMENT_TABLE
        .iter()
        .find(|(max_error, min_confidence, _)| {
            mean_error <= *max_error && mean_confidence >= *min_confidence
        })
        .map_or(CalibrationAssessment::Poor, |(_, _, assessment)| *assessment)
}

/// Analyze a finished session.
///
/// `rtt_uncertainty` holds the engine's current RTT-based uncertainty per
/// device and drives the cross-check; missing devices are skipped.
pub fn analyze_session(
    session: &CalibrationSession,
    rtt_uncertainty: &BTreeMap<DeviceId, f64>,
) -> CalibrationAnalysis {
    let total_events = session.events.len();
    let errors: Vec<f64> = session
        .events
        .iter()
        .filter_map(|event| event.sync_error())
        .collect();

    let mut per_device: BTreeMap<DeviceId, Vec<&CalibrationMeasurement>> = session
        .devices
        .iter()
        .map(|id| (id.clone(), Vec::new()))
        .collect();
    for measurement in session.events.iter().flat_map(|e| &e.measurements) {
        per_device
            .entry(measurement.device_id.clone())
            .or_default()
            .push(measurement);
    }

    let devices: BTreeMap<DeviceId, DeviceCalibrationStats> = per_device
        .into_iter()
        .map(|(id, measurements)| {
            let device_stats = device_stats(&id, &measurements, total_events, rtt_uncertainty);
            (id, device_stats)
        })
        .collect();

    let confidences: Vec<f64> = session
        .events
        .iter()
        .flat_map(|e| e.measurements.iter().map(|m| m.confidence))
        .collect();

    let mut analysis = CalibrationAnalysis {
        session_id: session.session_id.clone(),
        assessment: CalibrationAssessment::InsufficientData,
        total_events,
        responsive_events: errors.len(),
        mean_error: stats::mean(&errors),
        max_error: errors.iter().copied().reduce(f64::max),
        p95_error: stats::percentile(&errors, 95.0),
        mean_confidence: stats::mean(&confidences),
        devices,
        recommendations: Vec::new(),
    };

    match (analysis.mean_error, analysis.mean_confidence) {
        (Some(mean_error), Some(mean_confidence)) => {
            analysis.assessment = assess(mean_error, mean_confidence);
            analysis.recommendations = recommendations(&analysis);
        }
        _ => analysis.recommendations.push(
            "No detections were received; check device connectivity and trigger detection"
                .to_string(),
        ),
    }
    analysis
}

fn device_stats(
    device_id: &DeviceId,
    measurements: &[&CalibrationMeasurement],
    total_events: usize,
    rtt_uncertainty: &BTreeMap<DeviceId, f64>,
) -> DeviceCalibrationStats {
    let delays: Vec<f64> = measurements.iter().map(|m| m.detection_delay()).collect();
    let confidences: Vec<f64> = measurements.iter().map(|m| m.confidence).collect();
    let response_rate = if total_events == 0 {
        0.0
    } else {
        measurements.len() as f64 / total_events as f64
    };

    DeviceCalibrationStats {
        device_id: device_id.clone(),
        responses: measurements.len(),
        average_delay: stats::mean(&delays).unwrap_or(0.0),
        delay_variance: stats::variance(&delays).unwrap_or(0.0),
        response_rate,
        average_confidence: stats::mean(&confidences).unwrap_or(0.0),
        rtt_uncertainty: rtt_uncertainty.get(device_id).copied(),
    }
}

fn recommendations(analysis: &CalibrationAnalysis) -> Vec<String> {
    let mut out = Vec::new();
    let mean_error = analysis.mean_error.unwrap_or(0.0);

    match analysis.assessment {
        CalibrationAssessment::Poor => out.push(format!(
            "Mean calibration error {:.1} ms is high; resynchronize devices and check network latency",
            mean_error * 1000.0
        )),
        CalibrationAssessment::Fair => out.push(format!(
            "Mean calibration error {:.1} ms is acceptable; shorter sync intervals may improve it",
            mean_error * 1000.0
        )),
        _ => {}
    }

    if let Some(max_error) = analysis.max_error {
        if max_error > 2.0 * mean_error && max_error > 0.010 {
            out.push(format!(
                "Peak error {:.1} ms is well above the mean; look for intermittent network jitter",
                max_error * 1000.0
            ));
        }
    }

    if let Some(confidence) = analysis.mean_confidence {
        if confidence < LOW_CONFIDENCE {
            out.push(format!(
                "Low detection confidence ({confidence:.2}); improve trigger visibility or audibility"
            ));
        }
    }

    for device in analysis.devices.values() {
        if device.response_rate < LOW_RESPONSE_RATE {
            out.push(format!(
                "Device {} detected only {:.0}% of triggers; check its sensor placement",
                device.device_id,
                device.response_rate * 100.0
            ));
        }
    }

    out.extend(cross_check(analysis));

    if out.is_empty() {
        out.push("Synchronization verified; no action needed".to_string());
    }
    out
}

/// Compare each device's residual delay against its RTT uncertainty.
///
/// The residual is the device's mean detection delay minus the mean across
/// responding devices. A residual above twice the RTT uncertainty means the
/// symmetric-delay model is off for that device.
fn cross_check(analysis: &CalibrationAnalysis) -> Vec<String> {
    let responding: Vec<&DeviceCalibrationStats> = analysis
        .devices
        .values()
        .filter(|d| d.responses > 0)
        .collect();
    let delays: Vec<f64> = responding.iter().map(|d| d.average_delay).collect();
    let Some(group_delay) = stats::mean(&delays) else {
        return Vec::new();
    };

    responding
        .iter()
        .filter_map(|device| {
            let uncertainty = device.rtt_uncertainty?;
            let residual = device.average_delay - group_delay;
            (residual.abs() > (2.0 * uncertainty).max(CROSS_CHECK_FLOOR_S)).then(|| {
                format!(
                    "Device {}: calibration residual {:.1} ms exceeds its RTT uncertainty {:.1} ms; network delay may be asymmetric",
                    device.device_id,
                    residual * 1000.0,
                    uncertainty * 1000.0
                )
            })
        })
        .collect()
}
