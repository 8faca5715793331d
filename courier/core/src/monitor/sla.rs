//! SLA Evaluation
//!
//! Compares a channel's window aggregates against [`SlaConfig`]. A channel
//! with fewer than `min_samples` samples reports
//! [`SlaStatus::InsufficientData`] instead of a verdict.

use serde::Serialize;

use super::config::SlaConfig;
use super::metrics::ChannelMetric;

/// Compliance of one SLA dimension
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DimensionStatus {
    /// Whether the target is met
    pub compliant: bool,
    /// Observed value
    pub actual: f64,
    /// Configured target
    pub target: f64,
}

/// Per-dimension compliance flags for one channel
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlaReport {
    /// Success fraction at or above `target_availability`
    pub availability_status: DimensionStatus,
    /// p95 latency (ms) at or below `max_latency`
    pub latency_status: DimensionStatus,
    /// Samples/sec at or above `target_throughput`
    pub throughput_status: DimensionStatus,
    /// Failure fraction at or below `max_error_rate`
    pub error_rate_status: DimensionStatus,
    /// All four dimensions compliant
    pub compliant: bool,
}

/// SLA verdict for one channel
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SlaStatus {
    /// Not enough samples in the window to judge
    InsufficientData {
        /// Samples in the window
        sample_count: usize,
        /// Samples required
        required: usize,
    },
    /// Judged against the configured targets
    Evaluated(SlaReport),
}

impl SlaStatus {
    /// The report, if the channel had enough data
    #[must_use]
    pub fn report(&self) -> Option<&SlaReport> {
        match self {
            Self::Evaluated(report) => Some(report),
            Self::InsufficientData { .. } => None,
        }
    }

    /// `Some(true)` when compliant, `None` when there is not enough data
    #[must_use]
    pub fn is_compliant(&self) -> Option<bool> {
        self.report().map(|r| r.compliant)
    }
}

/// Judge `metric` against `sla`
#[must_use]
pub fn evaluate(metric: &ChannelMetric, sla: &SlaConfig, min_samples: usize) -> SlaStatus {
    if metric.sample_count < min_samples.max(1) {
        return SlaStatus::InsufficientData {
            sample_count: metric.sample_count,
            required: min_samples.max(1),
        };
    }

    let max_latency_ms = sla.max_latency.as_secs_f64() * 1000.0;

    let availability_status = DimensionStatus {
        compliant: metric.availability >= sla.target_availability,
        actual: metric.availability,
        target: sla.target_availability,
    };
    let latency_status = DimensionStatus {
        compliant: metric.p95_latency_ms <= max_latency_ms,
        actual: metric.p95_latency_ms,
        target: max_latency_ms,
    };
    let throughput_status = DimensionStatus {
        compliant: metric.throughput >= sla.target_throughput,
        actual: metric.throughput,
        target: sla.target_throughput,
    };
    let error_rate_status = DimensionStatus {
        compliant: metric.error_rate <= sla.max_error_rate,
        actual: metric.error_rate,
        target: sla.max_error_rate,
    };

    let compliant = availability_status.compliant
        && latency_status.compliant
        && throughput_status.compliant
        && error_rate_status.compliant;

    SlaStatus::Evaluated(SlaReport {
        availability_status,
        latency_status,
        throughput_status,
        error_rate_status,
        compliant,
    })
}
