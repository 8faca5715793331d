//! Retry Executor
//!
//! Runs an operation with bounded, exponentially backed-off retries.
//!
//! ```text
//! delay(n) = min(base_delay * backoff_multiplier^(n-1), max_delay) * uniform(1 - jitter, 1 + jitter)
//! ```
//!
//! Jittered delays are clamped to `[previous delay, max_delay]`, so the
//! sequence of waits never shrinks and never exceeds the cap. Only transient
//! errors are retried; anything else is returned from the attempt that
//! produced it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::config::RetryConfig;
use crate::clock::SharedClock;
use crate::error::DeliveryError;

/// Executes operations under a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    clock: SharedClock,
}

impl RetryExecutor {
    /// Create an executor
    pub fn new(config: RetryConfig, clock: SharedClock) -> Self {
        Self { config, clock }
    }

    /// The retry policy
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled =
            self.config.base_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.config.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.config.max_delay)
    }

    /// Jittered delay after failed attempt `attempt`, never below `previous`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, previous: Duration) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter_factor.clamp(0.0, 1.0);

        let jittered = if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
            Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
        } else {
            base
        };

        jittered.min(self.config.max_delay).max(previous)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// - the operation's own error if it is not transient
    /// - `DeliveryError::RetryExhausted` wrapping the last transient error
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, DeliveryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DeliveryError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut previous = Duration::ZERO;
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    return Err(DeliveryError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.delay_for_attempt(attempt, previous);
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying after transient failure"
                    );
                    self.clock.sleep(delay).await;
                    previous = delay;
                    attempt += 1;
                }
            }
        }
    }
}
