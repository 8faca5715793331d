#![allow(missing_docs)]
//! Performance Monitoring
//!
//! Ingests a [`MetricSample`] for every transmission attempt and keeps
//! per-channel rolling aggregates.
//!
//! ```text
//!  FailoverManager ──record(sample)──► SampleWindow (per channel)
//!                                          │
//!                      ┌───────────────────┼────────────────────┐
//!                      ▼                   ▼                    ▼
//!               get_metrics()      get_all_sla_status()   AlertTracker
//!                                                          │
//!                                            broadcast + recent log
//! ```
//!
//! - [`PerformanceMonitor::get_metrics`]: average/p95 latency, throughput,
//!   availability and error rate per channel
//! - [`PerformanceMonitor::get_all_sla_status`]: per-dimension compliance
//! - [`PerformanceMonitor::get_performance_comparison`]: best channel per
//!   latency, throughput and availability
//! - [`PerformanceMonitor::subscribe`]: edge-triggered [`AlertEvent`]s

pub mod alerts;
pub mod config;
pub mod metrics;
pub mod sla;

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::clock::SharedClock;
use crate::failover::CircuitBreakerSnapshot;
use crate::transport::ChannelId;

pub use alerts::{AlertEvent, AlertKind, AlertState, AlertTracker};
pub use config::{AlertConfig, MonitorConfig, SlaConfig};
pub use metrics::{ChannelMetric, MetricSample};
pub use sla::{DimensionStatus, SlaReport, SlaStatus};

use metrics::{LifetimeCounters, SampleWindow};

const ALERT_CHANNEL_CAPACITY: usize = 256;

/// The best channel for one dimension
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelRanking {
    pub channel_id: ChannelId,
    pub value: f64,
}

/// Best channel per dimension, over channels with samples in their window
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PerformanceComparison {
    /// Lowest p95 latency (ms)
    pub best_latency: Option<ChannelRanking>,
    /// Highest samples/sec
    pub best_throughput: Option<ChannelRanking>,
    /// Highest success fraction
    pub best_availability: Option<ChannelRanking>,
}

#[derive(Debug)]
struct ChannelStats {
    counters: LifetimeCounters,
    window: Mutex<SampleWindow>,
}

/// Aggregates samples, evaluates SLAs, and raises alerts
pub struct PerformanceMonitor {
    config: MonitorConfig,
    sla: SlaConfig,
    history_size: usize,
    clock: SharedClock,
    channels: DashMap<ChannelId, Arc<ChannelStats>>,
    alerts: Mutex<AlertTracker>,
    recent_alerts: Mutex<VecDeque<AlertEvent>>,
    alert_tx: broadcast::Sender<AlertEvent>,
}

impl PerformanceMonitor {
    pub fn new(
        config: MonitorConfig,
        sla: SlaConfig,
        alert_config: AlertConfig,
        clock: SharedClock,
    ) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            config,
            sla,
            history_size: alert_config.history_size.max(1),
            clock,
            channels: DashMap::new(),
            alerts: Mutex::new(AlertTracker::new(alert_config)),
            recent_alerts: Mutex::new(VecDeque::new()),
            alert_tx,
        }
    }

    fn stats_for(&self, channel_id: &ChannelId) -> Arc<ChannelStats> {
        if let Some(stats) = self.channels.get(channel_id) {
            return Arc::clone(&stats);
        }
        Arc::clone(
            self.channels
                .entry(channel_id.clone())
                .or_insert_with(|| {
                    Arc::new(ChannelStats {
                        counters: LifetimeCounters::default(),
                        window: Mutex::new(SampleWindow::new(&self.config)),
                    })
                })
                .value(),
        )
    }

    /// Ingest one outbound attempt
    pub fn record(&self, sample: MetricSample) {
        let channel_id = sample.channel_id.clone();
        let now = sample.timestamp;
        let stats = self.stats_for(&channel_id);

        if sample.success {
            stats.counters.messages_sent.inc();
            stats.counters.bytes_sent.add(sample.bytes as u64);
        } else {
            stats.counters.failures.inc();
        }

        let metric = {
            let mut window = stats.window.lock();
            window.push(sample);
            ChannelMetric::from_parts(channel_id, &stats.counters, &window.aggregate(now))
        };

        if metric.sample_count >= self.config.min_samples.max(1) {
            let events = self.alerts.lock().evaluate(&metric);
            for event in events {
                self.emit(event);
            }
        }
    }

    /// Count an inbound message
    pub fn record_received(&self, channel_id: &ChannelId, bytes: usize) {
        let stats = self.stats_for(channel_id);
        stats.counters.messages_received.inc();
        stats.counters.bytes_received.add(bytes as u64);
    }

    /// Count buffered messages that were lost because their batch failed
    pub fn record_dropped(&self, channel_id: &ChannelId, messages: usize) {
        let stats = self.stats_for(channel_id);
        stats.counters.messages_dropped.add(messages as u64);
    }

    fn emit(&self, event: AlertEvent) {
        match event.state {
            AlertState::Raised => tracing::warn!(
                channel = %event.channel_id,
                kind = ?event.kind,
                value = event.value,
                threshold = event.threshold,
                "Alert raised"
            ),
            AlertState::Resolved => tracing::info!(
                channel = %event.channel_id,
                kind = ?event.kind,
                value = event.value,
                "Alert resolved"
            ),
        }

        {
            let mut recent = self.recent_alerts.lock();
            recent.push_back(event.clone());
            while recent.len() > self.history_size {
                recent.pop_front();
            }
        }

        // No subscribers is fine
        let _ = self.alert_tx.send(event);
    }

    /// Current aggregate for one channel
    pub fn channel_metric(&self, channel_id: &ChannelId) -> Option<ChannelMetric> {
        let stats = Arc::clone(&*self.channels.get(channel_id)?);
        Some(self.snapshot(channel_id.clone(), &stats))
    }

    fn snapshot(&self, channel_id: ChannelId, stats: &ChannelStats) -> ChannelMetric {
        let now = self.clock.now();
        let mut window = stats.window.lock();
        window.evict(now);
        ChannelMetric::from_parts(channel_id, &stats.counters, &window.aggregate(now))
    }

    /// Aggregates for every channel seen so far, ordered by channel id
    pub fn get_metrics(&self) -> Vec<ChannelMetric> {
        let entries: Vec<(ChannelId, Arc<ChannelStats>)> = self
            .channels
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut metrics: Vec<ChannelMetric> = entries
            .into_iter()
            .map(|(id, stats)| self.snapshot(id, &stats))
            .collect();
        metrics.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        metrics
    }

    /// SLA verdict per channel
    pub fn get_all_sla_status(&self) -> BTreeMap<ChannelId, SlaStatus> {
        self.get_metrics()
            .into_iter()
            .map(|metric| {
                let status = sla::evaluate(&metric, &self.sla, self.config.min_samples);
                (metric.channel_id, status)
            })
            .collect()
    }

    /// Best channel for latency, throughput and availability
    pub fn get_performance_comparison(&self) -> PerformanceComparison {
        let metrics: Vec<ChannelMetric> = self
            .get_metrics()
            .into_iter()
            .filter(|m| m.sample_count > 0)
            .collect();

        let rank = |value: fn(&ChannelMetric) -> f64, lower_is_better: bool| {
            metrics
                .iter()
                .min_by(|a, b| {
                    let ord = value(a).total_cmp(&value(b));
                    if lower_is_better {
                        ord
                    } else {
                        ord.reverse()
                    }
                })
                .map(|m| ChannelRanking {
                    channel_id: m.channel_id.clone(),
                    value: value(m),
                })
        };

        PerformanceComparison {
            best_latency: rank(|m| m.p95_latency_ms, true),
            best_throughput: rank(|m| m.throughput, false),
            best_availability: rank(|m| m.availability, false),
        }
    }

    /// Subscribe to alert transitions
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    /// Most recent alert transitions, oldest first
    pub fn recent_alerts(&self) -> Vec<AlertEvent> {
        self.recent_alerts.lock().iter().cloned().collect()
    }

    /// Drop a channel's window, counters and alert state
    pub fn remove_channel(&self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
        self.alerts.lock().clear_channel(channel_id);
    }

    /// Prometheus text exposition of channel aggregates and breaker states
    pub fn to_prometheus(&self, breakers: &[CircuitBreakerSnapshot]) -> String {
        let mut output = String::new();
        let metrics = self.get_metrics();

        let series: [(&str, &str, &str, fn(&ChannelMetric) -> f64); 8] = [
            ("courier_messages_sent_total", "counter", "Successful sends", |m| {
                m.messages_sent as f64
            }),
            (
                "courier_messages_received_total",
                "counter",
                "Inbound messages",
                |m| m.messages_received as f64,
            ),
            ("courier_failures_total", "counter", "Failed attempts", |m| {
                m.failures as f64
            }),
            (
                "courier_messages_dropped_total",
                "counter",
                "Batched messages lost with a failed batch",
                |m| m.messages_dropped as f64,
            ),
            (
                "courier_latency_p95_ms",
                "gauge",
                "p95 latency over the window",
                |m| m.p95_latency_ms,
            ),
            (
                "courier_throughput",
                "gauge",
                "Samples per second over the window",
                |m| m.throughput,
            ),
            (
                "courier_availability",
                "gauge",
                "Success fraction over the window",
                |m| m.availability,
            ),
            (
                "courier_error_rate",
                "gauge",
                "Failure fraction over the window",
                |m| m.error_rate,
            ),
        ];

        for (name, kind, help, value) in series {
            let _ = writeln!(output, "# HELP {name} {help}\n# TYPE {name} {kind}");
            for metric in &metrics {
                let _ = writeln!(
                    output,
                    "{name}{{channel=\"{}\"}} {}",
                    metric.channel_id,
                    value(metric)
                );
            }
            output.push('\n');
        }

        let _ = writeln!(
            output,
            "# HELP courier_circuit_state Breaker state (0=closed, 1=open, 2=half-open)\n\
             # TYPE courier_circuit_state gauge"
        );
        for breaker in breakers {
            let _ = writeln!(
                output,
                "courier_circuit_state{{channel=\"{}\"}} {}",
                breaker.channel_id,
                breaker.state.as_gauge()
            );
        }

        output
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("channels", &self.channels.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
