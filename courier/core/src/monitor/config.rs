//! Monitoring Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Service-level objectives every channel is measured against
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    /// Minimum success fraction (0.0 - 1.0)
    pub target_availability: f64,

    /// Maximum p95 latency
    #[serde(rename = "max_latency_ms", with = "crate::config::duration_ms")]
    pub max_latency: Duration,

    /// Minimum samples per second
    pub target_throughput: f64,

    /// Maximum failure fraction (0.0 - 1.0)
    pub max_error_rate: f64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            target_availability: 0.995,
            max_latency: Duration::from_millis(500),
            target_throughput: 0.0,
            max_error_rate: 0.01,
        }
    }
}

/// Thresholds that raise alerts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// p95 latency above this raises a latency alert
    #[serde(rename = "latency_threshold_ms", with = "crate::config::duration_ms")]
    pub latency_threshold: Duration,

    /// Error rate above this raises an error-rate alert
    pub error_rate_threshold: f64,

    /// Availability below this raises an availability alert
    pub availability_threshold: f64,

    /// Alerts kept in the recent-alert log
    pub history_size: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            latency_threshold: Duration::from_millis(1000),
            error_rate_threshold: 0.05,
            availability_threshold: 0.99,
            history_size: 256,
        }
    }
}

/// Sliding-window sizing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum samples kept per channel
    pub window_size: usize,

    /// Samples older than this are dropped from the window
    #[serde(rename = "window_duration_ms", with = "crate::config::duration_ms")]
    pub window_duration: Duration,

    /// Samples required before SLA and alert evaluation
    pub min_samples: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            window_duration: Duration::from_secs(60),
            min_samples: 10,
        }
    }
}
