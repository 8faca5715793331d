#![allow(missing_docs)]
//! Chunked Stream Transfer
//!
//! Moves payloads too large for a single message as a session of numbered
//! chunks with sliding-window flow control.
//!
//! # Protocol
//!
//! ```text
//!  sender                                   receiver
//!    │── StreamStart {metadata, chunk_size} ──►│
//!    │── StreamChunk {seq 0} ─────────────────►│
//!    │── StreamChunk {seq 1} ─────────────────►│   at most window_size
//!    │◄──────────────────── StreamAck {seq 0} ──│   unacknowledged
//!    │── StreamChunk {seq 2} ─────────────────►│
//!    │          ...                            │
//!    │── StreamEnd {total_chunks} ────────────►│
//!    │◄─────────── StreamAck {seq total_chunks} │
//! ```
//!
//! - A missing acknowledgment retransmits only the unacknowledged tail of
//!   the window.
//! - Chunks larger than `compression_threshold` are zlib-compressed when
//!   enabled.
//! - `StreamAbort` tears the session down on both sides and releases its
//!   state immediately.
//!
//! Each session owns its window; sessions never share flow-control state.

mod engine;
mod receiver;
mod sender;
mod window;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::messages::{Envelope, Priority};

pub use engine::{CompletedStream, StreamEngine};
pub use receiver::StreamReceiver;
pub use sender::{StreamSender, StreamSummary};
pub use window::SendWindow;

// ============================================================================
// Configuration
// ============================================================================

/// Stream flow-control tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Largest chunk payload before compression
    pub max_chunk_size: usize,

    /// Unacknowledged chunks allowed in flight
    pub window_size: usize,

    /// Compress chunks above `compression_threshold`
    pub enable_compression: bool,

    /// Chunk size above which compression is attempted
    pub compression_threshold: usize,

    /// Wait for an acknowledgment before retransmitting the window tail
    #[serde(rename = "ack_timeout_ms", with = "crate::config::duration_ms")]
    pub ack_timeout: Duration,

    /// Retransmissions of one chunk before the session is aborted
    pub max_retransmits: u32,

    /// Largest `total_size` accepted from a peer
    pub max_stream_size: u64,

    /// Inbound sessions open at once
    pub max_concurrent_streams: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 64 * 1024,
            window_size: 8,
            enable_compression: true,
            compression_threshold: 4096,
            ack_timeout: Duration::from_secs(5),
            max_retransmits: 5,
            max_stream_size: 1024 * 1024 * 1024,
            max_concurrent_streams: 16,
        }
    }
}

impl StreamConfig {
    /// Silence after which an inbound session is given up on
    ///
    /// Long enough for the sender to exhaust every retransmission.
    #[must_use]
    pub fn inbound_idle_timeout(&self) -> Duration {
        self.ack_timeout
            .saturating_mul(self.max_retransmits.saturating_add(1))
    }
}

/// Sent once at session start
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Exact number of payload bytes the session will carry
    pub total_size: u64,
    /// MIME type or application-defined label
    pub content_type: String,
    /// Priority of the transfer
    pub priority: Priority,
    /// Free-form properties
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl StreamMetadata {
    /// Metadata for a payload of `total_size` bytes
    pub fn new(total_size: u64, content_type: impl Into<String>) -> Self {
        Self {
            total_size,
            content_type: content_type.into(),
            ..Default::default()
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a property
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Where a stream session writes its envelopes
///
/// The delivery core routes these through the failover path of the
/// session's channel.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Send one envelope to the peer
    async fn send_envelope(&self, envelope: Envelope) -> Result<()>;
}

/// Reason codes carried by `StreamAbort`
pub mod abort_reason {
    /// The sender gave up waiting for acknowledgments
    pub const ACK_TIMEOUT: &str = "ack_timeout";
    /// Bytes written differ from the announced `total_size`
    pub const SIZE_MISMATCH: &str = "size_mismatch";
    /// A chunk arrived for a session the receiver does not know
    pub const UNKNOWN_SESSION: &str = "unknown_session";
    /// The receiver is at `max_concurrent_streams`
    pub const TOO_MANY_STREAMS: &str = "too_many_streams";
    /// The announced size exceeds `max_stream_size`
    pub const TOO_LARGE: &str = "too_large";
    /// A chunk could not be decoded
    pub const CORRUPT_CHUNK: &str = "corrupt_chunk";
    /// The sending handle was dropped without closing
    pub const CANCELLED: &str = "cancelled";
    /// The receiver heard nothing for `inbound_idle_timeout`
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
}
