//! Edge-Triggered Alerts
//!
//! Each (channel, kind) pair is either quiet or firing. Crossing a threshold
//! emits one `Raised` event; nothing more is emitted for that pair until the
//! metric is back within the threshold, which emits one `Resolved` event.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::AlertConfig;
use super::metrics::ChannelMetric;
use crate::transport::ChannelId;

/// Which metric crossed its threshold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// p95 latency above `latency_threshold`
    Latency,
    /// Error rate above `error_rate_threshold`
    ErrorRate,
    /// Availability below `availability_threshold`
    Availability,
}

impl AlertKind {
    const ALL: [AlertKind; 3] = [Self::Latency, Self::ErrorRate, Self::Availability];
}

/// Edge direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// Threshold crossed
    Raised,
    /// Metric back within threshold
    Resolved,
}

/// One alert transition
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertEvent {
    /// Channel the alert is about
    pub channel_id: ChannelId,
    /// Metric that crossed
    pub kind: AlertKind,
    /// Raised or resolved
    pub state: AlertState,
    /// Observed value (ms for latency, fraction otherwise)
    pub value: f64,
    /// Threshold it was compared against
    pub threshold: f64,
    /// Wall-clock time of the transition
    pub raised_at: DateTime<Utc>,
}

/// Tracks which alerts are currently firing
#[derive(Debug)]
pub struct AlertTracker {
    config: AlertConfig,
    firing: HashSet<(ChannelId, AlertKind)>,
}

impl AlertTracker {
    /// Create a tracker with nothing firing
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            firing: HashSet::new(),
        }
    }

    /// Compare `metric` to the thresholds, returning only state changes
    pub fn evaluate(&mut self, metric: &ChannelMetric) -> Vec<AlertEvent> {
        let mut events = Vec::new();

        for kind in AlertKind::ALL {
            let (value, threshold, breached) = self.check(kind, metric);
            let key = (metric.channel_id.clone(), kind);

            let state = match (breached, self.firing.contains(&key)) {
                (true, false) => {
                    self.firing.insert(key);
                    AlertState::Raised
                }
                (false, true) => {
                    self.firing.remove(&key);
                    AlertState::Resolved
                }
                _ => continue,
            };

            events.push(AlertEvent {
                channel_id: metric.channel_id.clone(),
                kind,
                state,
                value,
                threshold,
                raised_at: Utc::now(),
            });
        }

        events
    }

    fn check(&self, kind: AlertKind, metric: &ChannelMetric) -> (f64, f64, bool) {
        match kind {
            AlertKind::Latency => {
                let threshold = self.config.latency_threshold.as_secs_f64() * 1000.0;
                (
                    metric.p95_latency_ms,
                    threshold,
                    metric.p95_latency_ms > threshold,
                )
            }
            AlertKind::ErrorRate => {
                let threshold = self.config.error_rate_threshold;
                (metric.error_rate, threshold, metric.error_rate > threshold)
            }
            AlertKind::Availability => {
                let threshold = self.config.availability_threshold;
                (
                    metric.availability,
                    threshold,
                    metric.availability < threshold,
                )
            }
        }
    }

    /// Whether `kind` is firing for `channel_id`
    #[must_use]
    pub fn is_firing(&self, channel_id: &ChannelId, kind: AlertKind) -> bool {
        self.firing.contains(&(channel_id.clone(), kind))
    }

    /// Forget a channel's alerts
    pub fn clear_channel(&mut self, channel_id: &ChannelId) {
        self.firing.retain(|(id, _)| id != channel_id);
    }
}
