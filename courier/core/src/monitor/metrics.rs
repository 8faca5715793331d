//! Channel Metrics
//!
//! Raw samples go into a per-channel sliding window bounded by count and age.
//! [`ChannelMetric`] is recomputed from that window on demand; lifetime
//! counters survive window eviction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::config::MonitorConfig;
use crate::transport::ChannelId;

// ============================================================================
// Samples
// ============================================================================

/// One completed transmission attempt
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    /// Channel the attempt used
    pub channel_id: ChannelId,
    /// Clock time the attempt finished
    pub timestamp: Duration,
    /// Time spent on the attempt
    pub latency: Duration,
    /// Whether the attempt succeeded
    pub success: bool,
    /// Payload bytes carried
    pub bytes: usize,
}

// ============================================================================
// Counter
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Lifetime totals for one channel
#[derive(Debug, Default)]
pub struct LifetimeCounters {
    pub messages_sent: Counter,
    pub messages_received: Counter,
    pub failures: Counter,
    /// Buffered messages lost with a batch that could not be sent
    pub messages_dropped: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
}

// ============================================================================
// Sliding Window
// ============================================================================

/// Recent samples for one channel, oldest first
#[derive(Debug)]
pub struct SampleWindow {
    samples: VecDeque<MetricSample>,
    max_samples: usize,
    max_age: Duration,
}

impl SampleWindow {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.window_size.min(4096)),
            max_samples: config.window_size.max(1),
            max_age: config.window_duration,
        }
    }

    pub fn push(&mut self, sample: MetricSample) {
        let now = sample.timestamp;
        self.samples.push_back(sample);
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        self.evict(now);
    }

    /// Drop samples older than the window duration
    pub fn evict(&mut self, now: Duration) {
        let cutoff = now.saturating_sub(self.max_age);
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Aggregate the window as seen at `now`
    pub fn aggregate(&self, now: Duration) -> WindowStats {
        let count = self.samples.len();
        if count == 0 {
            return WindowStats::default();
        }

        let failures = self.samples.iter().filter(|s| !s.success).count();
        let mut latencies: Vec<Duration> = self.samples.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();

        let total: Duration = latencies.iter().sum();
        let avg = total / u32::try_from(count).unwrap_or(u32::MAX);

        // Nearest-rank percentile
        let rank = ((count as f64) * 0.95).ceil() as usize;
        let p95 = latencies[rank.clamp(1, count) - 1];

        // At least one second of span so a burst doesn't read as infinite rate
        let oldest = self.samples.front().map_or(now, |s| s.timestamp);
        let span = now.saturating_sub(oldest).max(Duration::from_secs(1));

        let error_rate = failures as f64 / count as f64;

        WindowStats {
            sample_count: count,
            error_rate,
            availability: 1.0 - error_rate,
            avg_latency: avg,
            p95_latency: p95,
            throughput: count as f64 / span.as_secs_f64(),
        }
    }
}

/// Aggregates over one window
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WindowStats {
    pub sample_count: usize,
    pub error_rate: f64,
    pub availability: f64,
    pub avg_latency: Duration,
    pub p95_latency: Duration,
    pub throughput: f64,
}

// ============================================================================
// Derived Metric
// ============================================================================

/// Per-channel aggregate snapshot
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelMetric {
    pub channel_id: ChannelId,
    /// Lifetime successful sends
    pub messages_sent: u64,
    /// Lifetime inbound messages
    pub messages_received: u64,
    /// Lifetime failed attempts
    pub failures: u64,
    /// Lifetime low-priority messages lost with a failed batch
    pub messages_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Samples currently in the window
    pub sample_count: usize,
    /// Failure fraction over the window
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    /// Samples per second over the window
    pub throughput: f64,
    /// Success fraction over the window (1.0 when empty)
    pub availability: f64,
}

impl ChannelMetric {
    pub(crate) fn from_parts(
        channel_id: ChannelId,
        counters: &LifetimeCounters,
        stats: &WindowStats,
    ) -> Self {
        let availability = if stats.sample_count == 0 {
            1.0
        } else {
            stats.availability
        };

        Self {
            channel_id,
            messages_sent: counters.messages_sent.get(),
            messages_received: counters.messages_received.get(),
            failures: counters.failures.get(),
            messages_dropped: counters.messages_dropped.get(),
            bytes_sent: counters.bytes_sent.get(),
            bytes_received: counters.bytes_received.get(),
            sample_count: stats.sample_count,
            error_rate: stats.error_rate,
            avg_latency_ms: stats.avg_latency.as_secs_f64() * 1000.0,
            p95_latency_ms: stats.p95_latency.as_secs_f64() * 1000.0,
            throughput: stats.throughput,
            availability,
        }
    }
}
