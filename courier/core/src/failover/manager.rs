//! Failover Manager
//!
//! Binds one circuit breaker, retry executor and batcher to every registered
//! channel and exposes a single fault-tolerant send path:
//!
//! ```text
//! send ──► breaker gate ──► retry loop ──► attempt ──► Transport::transmit
//!              │                             │
//!              └─ CircuitOpen (fail fast)    └─ outcome ──► breaker + monitor
//! ```
//!
//! Every attempt is bounded by `performance.attempt_timeout`; a transmit
//! still pending at that point counts as a transient failure.
//!
//! Low-priority fire-and-forget messages are buffered in the channel's
//! batcher; the batches it releases go through the same retry loop. They are
//! delivered at most once: a batch that still fails after retries is dropped
//! and counted in the monitor's `messages_dropped`.

use std::sync::Arc;

use dashmap::DashMap;

use super::batch::{Batch, Batcher, FlushReason};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use super::config::FailoverConfig;
use super::retry::RetryExecutor;
use crate::clock::SharedClock;
use crate::error::{DeliveryError, Result};
use crate::messages::{Envelope, Message};
use crate::monitor::{MetricSample, PerformanceMonitor};
use crate::transport::{ChannelId, Transport};

/// A channel plus the machinery guarding it
pub struct ProtectedChannel {
    channel: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    batcher: tokio::sync::Mutex<Batcher>,
    destinations: Vec<String>,
}

impl ProtectedChannel {
    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.channel
    }

    /// The channel's breaker
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Destinations served; empty means any
    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    fn serves(&self, destination: &str) -> bool {
        self.destinations.is_empty() || self.destinations.iter().any(|d| d == destination)
    }

    fn circuit_open(&self) -> DeliveryError {
        DeliveryError::CircuitOpen {
            channel_id: self.channel.id().clone(),
            retry_after: self.breaker.retry_after(),
        }
    }
}

/// Fault-tolerant send path over every registered channel
pub struct FailoverManager {
    config: FailoverConfig,
    clock: SharedClock,
    monitor: Arc<PerformanceMonitor>,
    channels: DashMap<ChannelId, Arc<ProtectedChannel>>,
}

impl FailoverManager {
    /// Create a manager with no channels
    pub fn new(config: FailoverConfig, clock: SharedClock, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            config,
            clock,
            monitor,
            channels: DashMap::new(),
        }
    }

    /// Bind breaker, retry and batcher to a channel
    ///
    /// # Errors
    ///
    /// `DeliveryError::Permanent` if a channel with the same id is registered
    pub fn register(&self, channel: Arc<dyn Transport>, destinations: Vec<String>) -> Result<()> {
        let id = channel.id().clone();

        match self.channels.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DeliveryError::Permanent(format!(
                "channel {id} is already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(
                    channel = %id,
                    kind = %channel.kind(),
                    destinations = ?destinations,
                    "Channel registered"
                );
                slot.insert(Arc::new(ProtectedChannel {
                    breaker: CircuitBreaker::new(
                        id.clone(),
                        self.config.circuit_breaker.clone(),
                        Arc::clone(&self.clock),
                    ),
                    retry: RetryExecutor::new(self.config.retry.clone(), Arc::clone(&self.clock)),
                    batcher: tokio::sync::Mutex::new(Batcher::new(id, self.config.batch.clone())),
                    channel,
                    destinations,
                }));
                Ok(())
            }
        }
    }

    /// Flush, close and forget a channel
    ///
    /// # Errors
    ///
    /// `DeliveryError::UnknownChannel` if the id is not registered
    pub async fn deregister(&self, channel_id: &ChannelId) -> Result<()> {
        let (_, protected) = self
            .channels
            .remove(channel_id)
            .ok_or_else(|| DeliveryError::UnknownChannel(channel_id.clone()))?;

        let pending = protected.batcher.lock().await.flush(FlushReason::Manual);
        if let Some(batch) = pending {
            // Failure is logged and counted
            let _ = self.send_batch_or_drop(&protected, batch).await;
        }

        if let Err(err) = protected.channel.close().await {
            tracing::debug!(channel = %channel_id, error = %err, "Error closing channel");
        }
        tracing::info!(channel = %channel_id, "Channel deregistered");
        Ok(())
    }

    /// Registered channel, if any
    pub fn get(&self, channel_id: &ChannelId) -> Option<Arc<ProtectedChannel>> {
        self.channels.get(channel_id).map(|c| Arc::clone(&c))
    }

    fn require(&self, channel_id: &ChannelId) -> Result<Arc<ProtectedChannel>> {
        self.get(channel_id)
            .ok_or_else(|| DeliveryError::UnknownChannel(channel_id.clone()))
    }

    /// Every registered channel id, sorted
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Channels that serve `destination`, sorted
    pub fn channels_for(&self, destination: &str) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|e| e.value().serves(destination))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether the channel's breaker would reject a request now
    ///
    /// Unknown channels count as rejecting.
    pub fn is_rejecting(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .map_or(true, |c| c.breaker.is_rejecting())
    }

    /// Error to report when `channel_id` cannot be used right now
    pub fn rejection(&self, channel_id: &ChannelId) -> DeliveryError {
        match self.get(channel_id) {
            Some(protected) => protected.circuit_open(),
            None => DeliveryError::UnknownChannel(channel_id.clone()),
        }
    }

    /// Send an envelope immediately, with breaker and retry protection
    ///
    /// # Errors
    ///
    /// - `CircuitOpen` if the breaker rejects the first (or a later) attempt
    /// - `RetryExhausted` after `max_attempts` transient failures
    /// - `Permanent` on the first non-retryable failure
    pub async fn transmit(&self, channel_id: &ChannelId, envelope: Envelope) -> Result<()> {
        let protected = self.require(channel_id)?;
        self.transmit_protected(&protected, &envelope).await
    }

    async fn transmit_protected(&self, protected: &ProtectedChannel, envelope: &Envelope) -> Result<()> {
        if protected.breaker.is_rejecting() {
            return Err(protected.circuit_open());
        }
        protected
            .retry
            .execute(|_| self.attempt(protected, envelope))
            .await
    }

    async fn attempt(&self, protected: &ProtectedChannel, envelope: &Envelope) -> Result<()> {
        if !protected.breaker.allow_request() {
            return Err(protected.circuit_open());
        }

        let channel_id = protected.channel.id();
        let limit = self.config.performance.attempt_timeout;
        let started = self.clock.now();
        let result = tokio::select! {
            biased;
            sent = protected.channel.transmit(envelope.clone()) => {
                sent.map_err(|e| DeliveryError::from_transport(channel_id, e))
            }
            () = self.clock.sleep(limit) => Err(DeliveryError::Transient {
                channel_id: channel_id.clone(),
                reason: format!("transmit did not complete within {limit:?}"),
            }),
        };
        let finished = self.clock.now();

        let sample = |success| MetricSample {
            channel_id: channel_id.clone(),
            timestamp: finished,
            latency: finished.saturating_sub(started),
            success,
            bytes: envelope.payload_len(),
        };

        match result {
            Ok(()) => {
                protected.breaker.record_success();
                self.monitor.record(sample(true));
                Ok(())
            }
            Err(err) => {
                if err.is_transient() {
                    protected.breaker.record_failure();
                    self.monitor.record(sample(false));
                } else {
                    // Caller's fault, not the channel's
                    protected.breaker.release();
                }
                Err(err)
            }
        }
    }

    /// Send a fire-and-forget message, batching it if it is low priority
    ///
    /// # Errors
    ///
    /// As [`transmit`](Self::transmit); a batched message only errors if a
    /// batch its arrival released failed to send.
    pub async fn send_message(&self, channel_id: &ChannelId, message: Message) -> Result<()> {
        let protected = self.require(channel_id)?;

        if !message.priority.is_batchable() {
            return self
                .transmit_protected(&protected, &Envelope::Message { message })
                .await;
        }

        if protected.breaker.is_rejecting() {
            return Err(protected.circuit_open());
        }

        // Held across the send so batches leave in order
        let mut batcher = protected.batcher.lock().await;
        let mut outcome = Ok(());
        for batch in batcher.push(message, self.clock.now()) {
            if let Err(err) = self.send_batch_or_drop(&protected, batch).await {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }

    /// Send a released batch; on failure its messages are counted as dropped
    async fn send_batch_or_drop(&self, protected: &ProtectedChannel, batch: Batch) -> Result<()> {
        let count = batch.len();
        let result = self.send_batch(protected, batch).await;
        if let Err(err) = &result {
            self.monitor.record_dropped(protected.channel.id(), count);
            tracing::warn!(
                channel = %protected.channel.id(),
                messages = count,
                error = %err,
                "Dropped batch that could not be sent"
            );
        }
        result
    }

    async fn send_batch(&self, protected: &ProtectedChannel, mut batch: Batch) -> Result<()> {
        let envelope = if batch.messages.len() == 1 {
            Envelope::Message {
                message: batch.messages.remove(0),
            }
        } else {
            Envelope::Batch {
                messages: batch.messages,
            }
        };
        self.transmit_protected(protected, &envelope).await
    }

    /// Send every batch whose delay has elapsed; returns how many were sent
    pub async fn flush_expired(&self) -> usize {
        self.flush_where(|batcher, now| batcher.poll_expired(now))
            .await
    }

    /// Send everything buffered, regardless of age
    pub async fn flush_all(&self) -> usize {
        self.flush_where(|batcher, _| batcher.flush(FlushReason::Manual))
            .await
    }

    async fn flush_where<F>(&self, mut take: F) -> usize
    where
        F: FnMut(&mut Batcher, std::time::Duration) -> Option<Batch>,
    {
        let channels: Vec<Arc<ProtectedChannel>> =
            self.channels.iter().map(|e| Arc::clone(e.value())).collect();
        let mut sent = 0;

        for protected in channels {
            let mut batcher = protected.batcher.lock().await;
            let Some(batch) = take(&mut *batcher, self.clock.now()) else {
                continue;
            };
            if self.send_batch_or_drop(&protected, batch).await.is_ok() {
                sent += 1;
            }
        }

        sent
    }

    /// Breaker statistics for every channel, sorted by channel id
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<CircuitBreakerSnapshot> = self
            .channels
            .iter()
            .map(|e| e.value().breaker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        snapshots
    }

    /// Close every channel
    pub async fn close_all(&self) {
        let channels: Vec<Arc<ProtectedChannel>> =
            self.channels.iter().map(|e| Arc::clone(e.value())).collect();
        for protected in channels {
            if let Err(err) = protected.channel.close().await {
                tracing::debug!(channel = %protected.channel.id(), error = %err, "Error closing channel");
            }
        }
    }
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field("channels", &self.channel_ids())
            .finish_non_exhaustive()
    }
}
