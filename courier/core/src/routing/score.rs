//! Channel Scores
//!
//! One score per (destination, channel) pair, normalized to `[0, 1]` where
//! lower is better. Unseen pairs start at [`NEUTRAL_SCORE`].

use std::collections::HashMap;
use std::time::Duration;

use super::config::RoutingConfig;
use crate::transport::ChannelId;

/// Score of a pair with no history
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Outcome of one completed call
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub latency: Duration,
    pub success: bool,
    /// Calls in flight on the channel when this one finished
    pub in_flight: usize,
}

/// Learned scores
#[derive(Debug, Default)]
pub struct ScoreTable {
    scores: HashMap<(String, ChannelId), f64>,
}

impl ScoreTable {
    /// Current score, neutral when unseen
    pub fn get(&self, destination: &str, channel_id: &ChannelId) -> f64 {
        self.scores
            .get(&(destination.to_string(), channel_id.clone()))
            .copied()
            .unwrap_or(NEUTRAL_SCORE)
    }

    /// Fold an observation in with an exponential moving average
    pub fn update(
        &mut self,
        destination: &str,
        channel_id: &ChannelId,
        observation: &Observation,
        config: &RoutingConfig,
    ) -> f64 {
        let observed = observed_score(observation, config);
        let rate = config.learning_rate.clamp(0.0, 1.0);

        let score = self
            .scores
            .entry((destination.to_string(), channel_id.clone()))
            .or_insert(NEUTRAL_SCORE);
        *score = ((1.0 - rate) * *score + rate * observed).clamp(0.0, 1.0);
        *score
    }

    /// Forget every score involving `channel_id`
    pub fn remove_channel(&mut self, channel_id: &ChannelId) {
        self.scores.retain(|(_, id), _| id != channel_id);
    }
}

/// Weighted sum of normalized latency, failure and load, in `[0, 1]`
pub fn observed_score(observation: &Observation, config: &RoutingConfig) -> f64 {
    let weights = &config.weights;
    let total = weights.latency + weights.error_rate + weights.load;
    if total <= 0.0 {
        return NEUTRAL_SCORE;
    }

    let ceiling = config.latency_ceiling.as_secs_f64().max(f64::EPSILON);
    let latency = (observation.latency.as_secs_f64() / ceiling).min(1.0);
    let failure = if observation.success { 0.0 } else { 1.0 };
    let load = (observation.in_flight as f64 / config.load_ceiling.max(1) as f64).min(1.0);

    ((weights.latency * latency + weights.error_rate * failure + weights.load * load) / total)
        .clamp(0.0, 1.0)
}
