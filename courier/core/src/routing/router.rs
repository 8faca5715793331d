//! Channel Router
//!
//! Picks the best channel for a destination from learned scores.
//!
//! # Selection Flow
//!
//! ```text
//! 1. Cached entry for the destination, if unexpired and its breaker admits traffic
//! 2. Otherwise score every candidate whose breaker is not open
//! 3. Lowest score wins (near-ties broken by inverse-score weighting when balancing)
//! 4. Cache the decision for cache_ttl
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;

use super::config::RoutingConfig;
use super::score::{Observation, ScoreTable};
use crate::clock::SharedClock;
use crate::transport::ChannelId;

/// Floor applied before inverting scores for weighted selection
const MIN_WEIGHT_SCORE: f64 = 0.01;

/// A cached routing decision
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingEntry {
    /// Chosen channel
    pub channel_id: ChannelId,
    /// Its score when chosen
    pub score: f64,
    /// Clock time of the decision
    pub last_updated: Duration,
}

#[derive(Debug)]
struct CacheSlot {
    entry: RoutingEntry,
    /// Clock nanos of the last lookup, for LRU eviction
    last_used: AtomicU64,
}

impl CacheSlot {
    fn new(entry: RoutingEntry, now: Duration) -> Self {
        Self {
            entry,
            last_used: AtomicU64::new(nanos(now)),
        }
    }

    fn touch(&self, now: Duration) {
        self.last_used.fetch_max(nanos(now), Ordering::Relaxed);
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Decrements a channel's in-flight count when dropped
#[derive(Debug)]
pub struct LoadGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Chooses a channel per destination
pub struct ChannelRouter {
    config: RoutingConfig,
    clock: SharedClock,
    cache: RwLock<HashMap<String, CacheSlot>>,
    scores: RwLock<ScoreTable>,
    in_flight: DashMap<ChannelId, Arc<AtomicUsize>>,
}

impl ChannelRouter {
    pub fn new(config: RoutingConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            cache: RwLock::new(HashMap::new()),
            scores: RwLock::new(ScoreTable::default()),
            in_flight: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Best channel among `candidates` for `destination`
    ///
    /// Returns `None` when every candidate is rejecting.
    pub fn select_channel<F>(
        &self,
        destination: &str,
        candidates: &[ChannelId],
        is_rejecting: F,
    ) -> Option<RoutingEntry>
    where
        F: Fn(&ChannelId) -> bool,
    {
        let now = self.clock.now();

        {
            let cache = self.cache.read();
            if let Some(slot) = cache.get(destination) {
                let fresh = now.saturating_sub(slot.entry.last_updated) < self.config.cache_ttl;
                let usable = candidates.contains(&slot.entry.channel_id)
                    && !is_rejecting(&slot.entry.channel_id);
                if fresh && usable {
                    slot.touch(now);
                    return Some(slot.entry.clone());
                }
            }
        }

        let scored = self.score_candidates(destination, candidates, &is_rejecting, None);
        let (channel_id, score) = self.pick(&scored)?;

        tracing::debug!(
            destination,
            channel = %channel_id,
            score,
            candidates = scored.len(),
            "Routing decision"
        );

        let entry = RoutingEntry {
            channel_id,
            score,
            last_updated: now,
        };
        self.insert(destination, entry.clone(), now);
        Some(entry)
    }

    /// Best non-rejecting channel other than `exclude`, bypassing the cache
    pub fn select_alternate<F>(
        &self,
        destination: &str,
        candidates: &[ChannelId],
        exclude: &ChannelId,
        is_rejecting: F,
    ) -> Option<ChannelId>
    where
        F: Fn(&ChannelId) -> bool,
    {
        let scored = self.score_candidates(destination, candidates, &is_rejecting, Some(exclude));
        scored
            .into_iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    fn score_candidates<F>(
        &self,
        destination: &str,
        candidates: &[ChannelId],
        is_rejecting: &F,
        exclude: Option<&ChannelId>,
    ) -> Vec<(ChannelId, f64)>
    where
        F: Fn(&ChannelId) -> bool,
    {
        let scores = self.scores.read();
        candidates
            .iter()
            .filter(|id| Some(*id) != exclude && !is_rejecting(id))
            .map(|id| (id.clone(), scores.get(destination, id)))
            .collect()
    }

    fn pick(&self, scored: &[(ChannelId, f64)]) -> Option<(ChannelId, f64)> {
        let best = scored.iter().min_by(|a, b| a.1.total_cmp(&b.1))?;
        if !self.config.enable_load_balancing {
            return Some(best.clone());
        }

        let tied: Vec<&(ChannelId, f64)> = scored
            .iter()
            .filter(|(_, score)| *score <= best.1 + self.config.tie_tolerance)
            .collect();
        if tied.len() < 2 {
            return Some(best.clone());
        }

        let weights: Vec<f64> = tied
            .iter()
            .map(|(_, score)| 1.0 / score.max(MIN_WEIGHT_SCORE))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (candidate, weight) in tied.iter().zip(&weights) {
            if roll < *weight {
                return Some((*candidate).clone());
            }
            roll -= weight;
        }
        Some(best.clone())
    }

    fn insert(&self, destination: &str, entry: RoutingEntry, now: Duration) {
        let mut cache = self.cache.write();
        cache.insert(destination.to_string(), CacheSlot::new(entry, now));

        while cache.len() > self.config.max_cache_size.max(1) {
            let lru = cache
                .iter()
                .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                .map(|(dest, _)| dest.clone());
            match lru {
                Some(dest) => {
                    cache.remove(&dest);
                }
                None => break,
            }
        }
    }

    /// Mark a call as in flight on `channel_id` until the guard drops
    pub fn track(&self, channel_id: &ChannelId) -> LoadGuard {
        let counter = Arc::clone(
            self.in_flight
                .entry(channel_id.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .value(),
        );
        counter.fetch_add(1, Ordering::Relaxed);
        LoadGuard { counter }
    }

    fn load(&self, channel_id: &ChannelId) -> usize {
        self.in_flight
            .get(channel_id)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Feed a completed call back into the scores
    pub fn record_outcome(
        &self,
        destination: &str,
        channel_id: &ChannelId,
        latency: Duration,
        success: bool,
    ) {
        let observation = Observation {
            latency,
            success,
            in_flight: self.load(channel_id),
        };
        let score = self
            .scores
            .write()
            .update(destination, channel_id, &observation, &self.config);

        let mut cache = self.cache.write();
        let stale = match cache.get_mut(destination) {
            Some(slot) if slot.entry.channel_id == *channel_id => {
                slot.entry.score = score;
                !success
            }
            _ => false,
        };
        // A failure re-opens the decision on the next lookup
        if stale {
            cache.remove(destination);
        }
    }

    /// Current score for a pair
    pub fn score(&self, destination: &str, channel_id: &ChannelId) -> f64 {
        self.scores.read().get(destination, channel_id)
    }

    /// Drop the cached decision for `destination`
    pub fn invalidate(&self, destination: &str) {
        self.cache.write().remove(destination);
    }

    /// Forget everything about a deregistered channel
    pub fn remove_channel(&self, channel_id: &ChannelId) {
        self.cache
            .write()
            .retain(|_, slot| slot.entry.channel_id != *channel_id);
        self.scores.write().remove_channel(channel_id);
        self.in_flight.remove(channel_id);
    }

    /// Number of cached destinations
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }
}

impl std::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("config", &self.config)
            .field("cached", &self.cache_len())
            .finish_non_exhaustive()
    }
}
