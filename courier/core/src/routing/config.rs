//! Routing Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Channel selection tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// How long a routing decision is reused for a destination
    #[serde(rename = "cache_ttl_ms", with = "crate::config::duration_ms")]
    pub cache_ttl: Duration,

    /// Cached destinations before least-recently-used eviction
    pub max_cache_size: usize,

    /// Spread traffic across near-tied channels
    pub enable_load_balancing: bool,

    /// EMA weight of the newest observation (0.0 - 1.0]
    pub learning_rate: f64,

    /// Score weights (normalized by their sum)
    pub weights: ScoreWeights,

    /// Candidates within this distance of the best score count as tied
    pub tie_tolerance: f64,

    /// Latency mapped to the worst latency score
    #[serde(rename = "latency_ceiling_ms", with = "crate::config::duration_ms")]
    pub latency_ceiling: Duration,

    /// Concurrent calls on one channel mapped to the worst load score
    pub load_ceiling: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            max_cache_size: 1024,
            enable_load_balancing: true,
            learning_rate: 0.2,
            weights: ScoreWeights::default(),
            tie_tolerance: 0.05,
            latency_ceiling: Duration::from_secs(1),
            load_ceiling: 32,
        }
    }
}

/// Relative importance of each score component
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub latency: f64,
    pub error_rate: f64,
    pub load: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            error_rate: 0.5,
            load: 0.1,
        }
    }
}
