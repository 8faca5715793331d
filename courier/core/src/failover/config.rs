//! Failover Configuration
//!
//! Breaker, retry, batching and transport tuning for the fault-tolerant send
//! path. Durations are written as `*_ms` integers in TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::PerformanceConfig;

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Circuit breaker thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,

    /// How long the circuit stays open before admitting trial traffic
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,

    /// Trial requests admitted concurrently while half-open
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
        }
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry policy for transient failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,

    /// Upper bound on any single delay
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// Relative jitter applied to each delay (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

// ============================================================================
// Batch Configuration
// ============================================================================

/// Flush thresholds for low-priority batching
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush when this many messages are buffered
    pub max_batch_size: usize,

    /// Flush this long after the first message was buffered
    #[serde(rename = "max_batch_delay_ms", with = "crate::config::duration_ms")]
    pub max_batch_delay: Duration,

    /// Flush before the buffered payload bytes would exceed this
    pub max_batch_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            max_batch_delay: Duration::from_millis(50),
            max_batch_bytes: 256 * 1024,
        }
    }
}

// ============================================================================
// Failover Configuration
// ============================================================================

/// Everything the failover manager binds per channel
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Batching thresholds
    pub batch: BatchConfig,
    /// Transport tuning
    pub performance: PerformanceConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_read_as_millis() {
        let config: FailoverConfig = toml::from_str(
            r"
            [circuit_breaker]
            failure_threshold = 3
            timeout_ms = 1500

            [retry]
            base_delay_ms = 20
            max_delay_ms = 400

            [batch]
            max_batch_delay_ms = 5
            ",
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_millis(1500));
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(20));
        assert_eq!(config.retry.max_delay, Duration::from_millis(400));
        assert_eq!(config.batch.max_batch_delay, Duration::from_millis(5));
        assert_eq!(config.batch.max_batch_size, 64);
    }

    #[test]
    fn test_no_retry_policy() {
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
    }
}
