//! Monotonic Clock Abstraction
//!
//! Every time-dependent decision in the core (retry delays, request deadlines,
//! circuit breaker open duration, batch flush delay, stream retransmission)
//! reads time through a [`Clock`] handed in at construction.
//!
//! - [`SystemClock`] is backed by `tokio::time::Instant`, so a paused tokio
//!   runtime (`#[tokio::test(start_paused = true)]`) drives it deterministically.
//! - [`ManualClock`] only moves when told to and is meant for synchronous tests.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Source of monotonic time for the delivery core
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Time elapsed since this clock's origin. Never decreases.
    fn now(&self) -> Duration;

    /// Suspend the calling task for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Shared clock handle passed to every component
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the tokio timer
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    /// Create a shared handle to a fresh system clock
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock
///
/// `sleep` advances the clock by the requested duration and yields, so code
/// that waits on it completes immediately in virtual time.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock at time zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared manual clock
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Jump to an absolute time. Ignored if it would move the clock backwards.
    pub fn set(&self, to: Duration) {
        let nanos = u64::try_from(to.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_max(nanos, Ordering::AcqRel);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
