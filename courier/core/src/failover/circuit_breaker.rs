//! Channel Circuit Breaker
//!
//! Per-channel failure isolation:
//!
//! ```text
//! +--------+  failure_threshold   +-------+        timeout         +-----------+
//! | Closed | -------------------> | Open  | ---------------------> | Half-Open |
//! +--------+  consecutive fails   +-------+                        +-----------+
//!     ^                               ^                                  |
//!     |                               |           any failure            |
//!     |                               +----------------------------------+
//!     |              success_threshold consecutive successes             |
//!     +------------------------------------------------------------------+
//! ```
//!
//! - **Closed**: requests pass through, consecutive failures are counted
//! - **Open**: requests are rejected without touching the channel
//! - **Half-Open**: a bounded number of trial requests are admitted
//!
//! # Thread Safety
//!
//! All mutable state lives behind one lock, so every transition (and the
//! counters that drive it) is observed atomically. Time comes from the shared
//! [`Clock`](crate::clock::Clock).

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::config::CircuitBreakerConfig;
use crate::clock::SharedClock;
use crate::transport::ChannelId;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed (normal operation)
    #[default]
    Closed,

    /// Circuit is open (rejecting requests)
    Open,

    /// Circuit is half-open (trial traffic only)
    HalfOpen,
}

impl CircuitState {
    /// Numeric form used in metric exposition
    #[must_use]
    pub fn as_gauge(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Clock time the circuit last opened
    opened_at: Option<Duration>,
    /// Trial requests admitted but not yet resolved
    trials_in_flight: u32,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Circuit breaker guarding one channel
pub struct CircuitBreaker {
    channel_id: ChannelId,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(channel_id: ChannelId, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            channel_id,
            config,
            clock,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Channel this breaker guards
    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Current state, without applying the open-timeout transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a request right now would be rejected outright
    ///
    /// An Open circuit whose timeout has elapsed is not rejecting: the next
    /// `allow_request` will move it to Half-Open.
    pub fn is_rejecting(&self) -> bool {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => self.remaining_open(&inner, now) > Duration::ZERO,
            CircuitState::HalfOpen => inner.trials_in_flight >= self.config.half_open_max_requests,
        }
    }

    /// Ask to send one request through the channel
    ///
    /// Every `true` must be followed by exactly one of `record_success`,
    /// `record_failure` or `release`.
    pub fn allow_request(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.remaining_open(&inner, now) > Duration::ZERO {
                    inner.total_rejections += 1;
                    return false;
                }
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.trials_in_flight = 1;
                tracing::info!(channel = %self.channel_id, "Circuit breaker transitioning to half-open");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.config.half_open_max_requests {
                    inner.trials_in_flight += 1;
                    true
                } else {
                    inner.total_rejections += 1;
                    false
                }
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.trials_in_flight = 0;
                tracing::info!(channel = %self.channel_id, "Circuit breaker closed - channel recovered");
            }
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open reopens the circuit
                self.open(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Give back an admitted request whose outcome says nothing about the channel
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    /// Time until an open circuit admits trial traffic (zero if not open)
    pub fn retry_after(&self) -> Duration {
        let now = self.clock.now();
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            self.remaining_open(&inner, now)
        } else {
            Duration::ZERO
        }
    }

    /// Force the breaker to a specific state (for tests and operators)
    pub fn force_state(&self, state: CircuitState) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match state {
            CircuitState::Closed => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => self.open(&mut inner, now),
            CircuitState::HalfOpen => {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
            }
        }
        inner.trials_in_flight = 0;
    }

    /// Reset to a fresh closed breaker
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::default();
    }

    /// Get a snapshot of the current breaker state
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            channel_id: self.channel_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            open_for: inner.opened_at.map(|at| now.saturating_sub(at)),
            retry_after: (inner.state == CircuitState::Open)
                .then(|| self.remaining_open(&inner, now)),
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Duration) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trials_in_flight = 0;
        tracing::warn!(
            channel = %self.channel_id,
            consecutive_failures = inner.consecutive_failures,
            "Circuit breaker opened - channel isolated"
        );
    }

    fn remaining_open(&self, inner: &BreakerInner, now: Duration) -> Duration {
        let opened_at = inner.opened_at.unwrap_or(now);
        self.config
            .timeout
            .saturating_sub(now.saturating_sub(opened_at))
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("channel_id", &self.channel_id)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

/// Immutable snapshot of breaker state at a point in time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    /// Guarded channel
    pub channel_id: ChannelId,
    /// Breaker state
    pub state: CircuitState,
    /// Consecutive failure count
    pub consecutive_failures: u32,
    /// Consecutive success count
    pub consecutive_successes: u32,
    /// Total recorded successes
    pub total_successes: u64,
    /// Total recorded failures
    pub total_failures: u64,
    /// Requests rejected without reaching the channel
    pub total_rejections: u64,
    /// How long the circuit has been open, if it has opened since the last close
    pub open_for: Option<Duration>,
    /// Time until trial traffic is admitted, when open
    pub retry_after: Option<Duration>,
}
