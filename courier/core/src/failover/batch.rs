//! Low-Priority Batching
//!
//! Coalesces fire-and-forget `Low` priority messages bound for one channel
//! into a single framed [`Envelope::Batch`](crate::messages::Envelope::Batch).
//! A buffer is flushed on whichever comes first:
//!
//! - `max_batch_size` messages buffered
//! - `max_batch_delay` elapsed since the first buffered message
//! - adding the next message would push the buffer past `max_batch_bytes`
//!
//! Messages keep their enqueue order across flushes. A single message larger
//! than `max_batch_bytes` is never batched: it is emitted alone as an
//! [`FlushReason::Oversize`] batch, after whatever was buffered before it.

use std::time::Duration;

use super::config::BatchConfig;
use crate::messages::Message;
use crate::transport::ChannelId;

/// Why a batch was emitted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    /// Reached `max_batch_size`
    Size,
    /// Reached `max_batch_bytes`
    Bytes,
    /// `max_batch_delay` elapsed
    Delay,
    /// Single message over `max_batch_bytes`, sent on its own
    Oversize,
    /// Explicit flush (shutdown, channel removal)
    Manual,
}

/// Messages ready to go out together
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Destination channel
    pub channel_id: ChannelId,
    /// Messages in enqueue order
    pub messages: Vec<Message>,
    /// Total payload bytes
    pub bytes: usize,
    /// Flush trigger
    pub reason: FlushReason,
}

impl Batch {
    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch has no messages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Per-channel batch buffer
#[derive(Debug)]
pub struct Batcher {
    channel_id: ChannelId,
    config: BatchConfig,
    buffer: Vec<Message>,
    bytes: usize,
    /// Clock time the oldest buffered message arrived
    first_at: Option<Duration>,
}

impl Batcher {
    /// Create an empty batcher
    pub fn new(channel_id: ChannelId, config: BatchConfig) -> Self {
        let capacity = config.max_batch_size.min(1024);
        Self {
            channel_id,
            config,
            buffer: Vec::with_capacity(capacity),
            bytes: 0,
            first_at: None,
        }
    }

    /// Buffer a message, returning any batches that became ready (in order)
    pub fn push(&mut self, message: Message, now: Duration) -> Vec<Batch> {
        let size = message.size();
        let mut ready = Vec::new();

        if size > self.config.max_batch_bytes {
            ready.extend(self.flush(FlushReason::Bytes));
            ready.push(Batch {
                channel_id: self.channel_id.clone(),
                messages: vec![message],
                bytes: size,
                reason: FlushReason::Oversize,
            });
            return ready;
        }

        if !self.buffer.is_empty() && self.bytes + size > self.config.max_batch_bytes {
            ready.extend(self.flush(FlushReason::Bytes));
        }

        if self.buffer.is_empty() {
            self.first_at = Some(now);
        }
        self.bytes += size;
        self.buffer.push(message);

        if self.buffer.len() >= self.config.max_batch_size {
            ready.extend(self.flush(FlushReason::Size));
        } else if self.bytes >= self.config.max_batch_bytes {
            ready.extend(self.flush(FlushReason::Bytes));
        }

        ready
    }

    /// Flush if the oldest buffered message has waited `max_batch_delay`
    pub fn poll_expired(&mut self, now: Duration) -> Option<Batch> {
        let first_at = self.first_at?;
        if now.saturating_sub(first_at) >= self.config.max_batch_delay {
            self.flush(FlushReason::Delay)
        } else {
            None
        }
    }

    /// Take everything buffered
    pub fn flush(&mut self, reason: FlushReason) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }

        let messages = std::mem::take(&mut self.buffer);
        let bytes = std::mem::take(&mut self.bytes);
        self.first_at = None;

        tracing::debug!(
            channel = %self.channel_id,
            count = messages.len(),
            bytes,
            reason = ?reason,
            "Flushing batch"
        );

        Some(Batch {
            channel_id: self.channel_id.clone(),
            messages,
            bytes,
            reason,
        })
    }

    /// Clock time at which the current buffer expires
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.first_at.map(|at| at + self.config.max_batch_delay)
    }

    /// Buffered message count
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffered payload bytes
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }
}
