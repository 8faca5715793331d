//! TOML Configuration File Support
//!
//! Centralized configuration for the delivery core, read from
//! `~/.config/courier/courier.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. Environment variables (`COURIER_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! Every section is optional; missing keys keep their defaults. Durations are
//! integer milliseconds in fields ending in `_ms`.
//!
//! # Example Configuration
//!
//! ```toml
//! [routing]
//! cache_ttl_ms = 5000
//! enable_load_balancing = true
//!
//! [failover.circuit_breaker]
//! failure_threshold = 5
//! timeout_ms = 30000
//!
//! [failover.retry]
//! max_attempts = 3
//! base_delay_ms = 100
//!
//! [multiplexer]
//! request_timeout_ms = 30000
//!
//! [[channels]]
//! id = "orchestrator-ipc"
//! kind = "ipc"
//! destinations = ["orchestrator"]
//!
//! [[channels]]
//! id = "orchestrator-tcp"
//! kind = "tcp"
//! address = "127.0.0.1:7400"
//! destinations = ["orchestrator"]
//! ```

pub mod duration_ms;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::failover::FailoverConfig;
use crate::monitor::{AlertConfig, MonitorConfig, SlaConfig};
use crate::multiplexer::MultiplexerConfig;
use crate::queue::QueueConfig;
use crate::routing::RoutingConfig;
use crate::streaming::StreamConfig;
use crate::transport::ChannelDescriptor;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Complete delivery core configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Channel selection
    pub routing: RoutingConfig,
    /// Breaker, retry, batching and transport tuning
    pub failover: FailoverConfig,
    /// Service-level objectives
    pub sla: SlaConfig,
    /// Alert thresholds
    pub alerts: AlertConfig,
    /// Stream flow control
    pub stream: StreamConfig,
    /// Request deadlines
    pub multiplexer: MultiplexerConfig,
    /// Outbound queue capacities
    pub queue: QueueConfig,
    /// Metrics window
    pub monitor: MonitorConfig,
    /// Channels to connect at startup
    pub channels: Vec<ChannelDescriptor>,

    /// Where the configuration was loaded from
    #[serde(skip)]
    source: ConfigSource,

    /// Path of the file that was read, if any
    #[serde(skip)]
    config_file_path: Option<PathBuf>,
}

impl CourierConfig {
    /// Where the effective configuration came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Path of the file that was read, if any
    #[must_use]
    pub fn config_file_path(&self) -> Option<&PathBuf> {
        self.config_file_path.as_ref()
    }

    /// Check value ranges the components rely on
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(ok: bool, message: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::ValidationError(message.to_string()))
            }
        }
        fn fraction(value: f64) -> bool {
            (0.0..=1.0).contains(&value)
        }

        let breaker = &self.failover.circuit_breaker;
        check(
            breaker.failure_threshold > 0,
            "failover.circuit_breaker.failure_threshold must be at least 1",
        )?;
        check(
            breaker.success_threshold > 0,
            "failover.circuit_breaker.success_threshold must be at least 1",
        )?;
        check(
            breaker.half_open_max_requests > 0,
            "failover.circuit_breaker.half_open_max_requests must be at least 1",
        )?;

        let retry = &self.failover.retry;
        check(retry.max_attempts > 0, "failover.retry.max_attempts must be at least 1")?;
        check(
            retry.backoff_multiplier >= 1.0,
            "failover.retry.backoff_multiplier must be at least 1.0",
        )?;
        check(
            fraction(retry.jitter_factor),
            "failover.retry.jitter_factor must be within [0, 1]",
        )?;
        check(
            retry.base_delay <= retry.max_delay,
            "failover.retry.base_delay_ms must not exceed max_delay_ms",
        )?;

        check(
            !self.failover.performance.attempt_timeout.is_zero(),
            "failover.performance.attempt_timeout_ms must be at least 1",
        )?;

        let batch = &self.failover.batch;
        check(batch.max_batch_size > 0, "failover.batch.max_batch_size must be at least 1")?;
        check(batch.max_batch_bytes > 0, "failover.batch.max_batch_bytes must be at least 1")?;

        check(
            self.routing.learning_rate > 0.0 && self.routing.learning_rate <= 1.0,
            "routing.learning_rate must be within (0, 1]",
        )?;
        let weights = &self.routing.weights;
        check(
            weights.latency >= 0.0
                && weights.error_rate >= 0.0
                && weights.load >= 0.0
                && weights.latency + weights.error_rate + weights.load > 0.0,
            "routing.weights must be non-negative and not all zero",
        )?;

        check(self.stream.window_size > 0, "stream.window_size must be at least 1")?;
        check(self.stream.max_chunk_size > 0, "stream.max_chunk_size must be at least 1")?;
        check(
            self.stream.ack_timeout > Duration::ZERO,
            "stream.ack_timeout_ms must be positive",
        )?;

        check(
            fraction(self.sla.target_availability),
            "sla.target_availability must be within [0, 1]",
        )?;
        check(
            fraction(self.sla.max_error_rate),
            "sla.max_error_rate must be within [0, 1]",
        )?;
        check(
            fraction(self.alerts.error_rate_threshold),
            "alerts.error_rate_threshold must be within [0, 1]",
        )?;
        check(
            fraction(self.alerts.availability_threshold),
            "alerts.availability_threshold must be within [0, 1]",
        )?;

        check(self.monitor.window_size > 0, "monitor.window_size must be at least 1")?;
        check(
            self.multiplexer.request_timeout > Duration::ZERO,
            "multiplexer.request_timeout_ms must be positive",
        )?;
        check(
            self.multiplexer.sweep_interval > Duration::ZERO,
            "multiplexer.sweep_interval_ms must be positive",
        )?;
        check(self.queue.max_in_flight > 0, "queue.max_in_flight must be at least 1")?;

        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(&channel.id) {
                return Err(ConfigError::ValidationError(format!(
                    "channel id {} is configured twice",
                    channel.id
                )));
            }
            channel
                .endpoint()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/courier/courier.toml` or equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("courier").join("courier.toml"))
}

/// Load configuration from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<CourierConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only
///   defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed or
/// validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<CourierConfig, ConfigError> {
    let mut config = CourierConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            config = toml::from_str(&toml_content)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                channels = config.channels.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut CourierConfig) {
    let mut touched = false;

    if let Some(ms) = env_parse::<u64>("COURIER_REQUEST_TIMEOUT_MS") {
        config.multiplexer.request_timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(n) = env_parse::<u32>("COURIER_FAILURE_THRESHOLD") {
        config.failover.circuit_breaker.failure_threshold = n;
        touched = true;
    }
    if let Some(ms) = env_parse::<u64>("COURIER_BREAKER_TIMEOUT_MS") {
        config.failover.circuit_breaker.timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(n) = env_parse::<u32>("COURIER_MAX_ATTEMPTS") {
        config.failover.retry.max_attempts = n;
        touched = true;
    }
    if let Some(enabled) = env_flag("COURIER_COMPRESSION") {
        config.failover.performance.enable_compression = enabled;
        config.stream.enable_compression = enabled;
        touched = true;
    }
    if let Some(ms) = env_parse::<u64>("COURIER_ATTEMPT_TIMEOUT_MS") {
        config.failover.performance.attempt_timeout = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(enabled) = env_flag("COURIER_TCP_NODELAY") {
        config.failover.performance.tcp_nodelay = enabled;
        touched = true;
    }
    if let Some(n) = env_parse::<usize>("COURIER_STREAM_WINDOW") {
        config.stream.window_size = n;
        touched = true;
    }
    if let Some(n) = env_parse::<usize>("COURIER_MAX_IN_FLIGHT") {
        config.queue.max_in_flight = n;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CourierConfig::default();
        config.validate().unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("courier"));
            assert!(p.to_string_lossy().ends_with("courier.toml"));
        }
    }

    #[test]
    fn test_parse_sections_and_channels() {
        let file = write_toml(
            r#"
[routing]
cache_ttl_ms = 2500
enable_load_balancing = false

[failover.circuit_breaker]
failure_threshold = 3

[failover.performance]
tcp_nodelay = false

[sla]
max_latency_ms = 200

[stream]
window_size = 16

[queue]
low = 10

[[channels]]
id = "ipc-1"
kind = "ipc"
path = "/tmp/courier-test.sock"

[[channels]]
id = "tcp-1"
kind = "tcp"
address = "127.0.0.1:7400"
destinations = ["orchestrator"]
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.routing.cache_ttl, Duration::from_millis(2500));
        assert!(!config.routing.enable_load_balancing);
        assert_eq!(config.failover.circuit_breaker.failure_threshold, 3);
        assert!(!config.failover.performance.tcp_nodelay);
        assert_eq!(config.sla.max_latency, Duration::from_millis(200));
        assert_eq!(config.stream.window_size, 16);
        assert_eq!(config.queue.low, 10);
        assert_eq!(config.queue.critical, QueueConfig::default().critical);

        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].kind, ChannelKind::Ipc);
        assert_eq!(config.channels[1].destinations, vec!["orchestrator"]);
        assert_eq!(config.config_file_path(), Some(&file.path().to_path_buf()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = PathBuf::from("/nonexistent/path/courier.toml");
        let config = load_config_from_path(Some(path)).unwrap();
        assert!(config.config_file_path().is_none());
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[routing\ncache_ttl_ms = \"soon\"\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let file = write_toml("[failover.retry]\njitter_factor = 1.5\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(m)) if m.contains("jitter_factor")));

        let mut config = CourierConfig::default();
        config.routing.learning_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = CourierConfig::default();
        config.failover.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = CourierConfig::default();
        config.stream.window_size = 0;
        assert!(config.validate().is_err());

        let mut config = CourierConfig::default();
        config.sla.target_availability = 99.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_and_incomplete_channels_rejected() {
        let mut config = CourierConfig::default();
        config.channels = vec![
            ChannelDescriptor::tcp("tcp-1", "127.0.0.1:1"),
            ChannelDescriptor::tcp("tcp-1", "127.0.0.1:2"),
        ];
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(m)) if m.contains("twice")));

        let mut missing_address = ChannelDescriptor::tcp("tcp-2", "x");
        missing_address.address = None;
        config.channels = vec![missing_address];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml("[failover.retry]\nmax_attempts = 4\n");

        std::env::set_var("COURIER_MAX_IN_FLIGHT", "7");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        std::env::remove_var("COURIER_MAX_IN_FLIGHT");

        assert_eq!(config.failover.retry.max_attempts, 4);
        assert_eq!(config.queue.max_in_flight, 7);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let mut config = CourierConfig::default();
        config.channels.push(ChannelDescriptor::tcp("tcp-1", "127.0.0.1:7400"));

        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("request_timeout_ms"));
        let parsed: CourierConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
