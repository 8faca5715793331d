//! Message Types
//!
//! Outbound messages, responses, and the [`Envelope`] that carries them over a
//! channel. Everything that crosses the wire is an `Envelope` serialized as a
//! JSON frame (see [`crate::transport::frame`]).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::streaming::StreamMetadata;
use crate::transport::ChannelId;

// ============================================================================
// Priority
// ============================================================================

/// Delivery priority tier, ordered lowest to highest
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Bulk traffic, eligible for batching
    Low = 0,
    /// Regular traffic
    #[default]
    Normal = 1,
    /// Latency-sensitive traffic
    High = 2,
    /// Control traffic that must never wait behind anything else
    Critical = 3,
}

impl Priority {
    /// All tiers, highest first (dequeue order)
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Whether fire-and-forget traffic at this tier goes through the batcher
    #[must_use]
    pub fn is_batchable(self) -> bool {
        self == Priority::Low
    }

    /// Stable index of the tier (0 = Low)
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Unique message identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a new random message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id for a request/response exchange
///
/// Allocated by the [`RequestMultiplexer`](crate::multiplexer::RequestMultiplexer);
/// unique among all requests outstanding at the same time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req_{}", self.0)
    }
}

/// Stream session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn new() -> Self {
        let bytes: [u8; 8] = rand::random();
        Self(format!("stream_{}", hex::encode(bytes)))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message
// ============================================================================

/// An outbound message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id
    pub id: MessageId,
    /// Logical destination (service name, peer name)
    pub destination: String,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Delivery priority
    pub priority: Priority,
    /// Creation time on the sender's monotonic clock (not transmitted)
    #[serde(skip)]
    pub created_at: Duration,
}

impl Message {
    /// Create a new message
    pub fn new(
        destination: impl Into<String>,
        payload: Vec<u8>,
        priority: Priority,
        created_at: Duration,
    ) -> Self {
        Self {
            id: MessageId::new(),
            destination: destination.into(),
            payload,
            priority,
            created_at,
        }
    }

    /// Payload size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// A response delivered to the caller of `send`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Request this answers
    pub request_id: RequestId,
    /// Channel the response arrived on
    pub channel_id: ChannelId,
    /// Response body
    pub payload: Vec<u8>,
}

// ============================================================================
// Wire Envelope
// ============================================================================

/// Everything that travels over a channel
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// A request expecting a [`Envelope::Response`] with the same id
    Request {
        /// Correlation id
        request_id: RequestId,
        /// The request body
        message: Message,
    },
    /// Reply to a request
    Response {
        /// Correlation id
        request_id: RequestId,
        /// Response body
        payload: Vec<u8>,
        /// Set when the peer failed to handle the request
        error: Option<String>,
    },
    /// Fire-and-forget message
    Message {
        /// The message
        message: Message,
    },
    /// Several fire-and-forget messages, in enqueue order
    Batch {
        /// The messages
        messages: Vec<Message>,
    },
    /// Opens a stream session
    StreamStart {
        /// Session id chosen by the sender
        session_id: SessionId,
        /// Size, content type, priority, properties
        metadata: StreamMetadata,
        /// Size of every chunk except possibly the last
        chunk_size: usize,
    },
    /// One chunk of a stream
    StreamChunk {
        /// Session the chunk belongs to
        session_id: SessionId,
        /// Chunk sequence number, starting at 0
        seq: u64,
        /// Whether `data` is zlib-compressed
        compressed: bool,
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// End-of-stream marker; acknowledged with `seq == total_chunks`
    StreamEnd {
        /// Session being completed
        session_id: SessionId,
        /// Number of chunks sent
        total_chunks: u64,
    },
    /// Acknowledges one chunk (or the end marker)
    StreamAck {
        /// Session being acknowledged
        session_id: SessionId,
        /// Acknowledged sequence number
        seq: u64,
    },
    /// Tears a session down on both sides
    StreamAbort {
        /// Session being aborted
        session_id: SessionId,
        /// Reason code
        reason: String,
    },
}

impl Envelope {
    /// Short label used in logs and metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Message { .. } => "message",
            Self::Batch { .. } => "batch",
            Self::StreamStart { .. } => "stream_start",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::StreamEnd { .. } => "stream_end",
            Self::StreamAck { .. } => "stream_ack",
            Self::StreamAbort { .. } => "stream_abort",
        }
    }

    /// Approximate payload bytes carried, for throughput accounting
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Request { message, .. } | Self::Message { message } => message.size(),
            Self::Response { payload, .. } => payload.len(),
            Self::Batch { messages } => messages.iter().map(Message::size).sum(),
            Self::StreamChunk { data, .. } => data.len(),
            Self::StreamStart { .. }
            | Self::StreamEnd { .. }
            | Self::StreamAck { .. }
            | Self::StreamAbort { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::DESCENDING[0], Priority::Critical);
        assert_eq!(Priority::DESCENDING[3], Priority::Low);
    }

    #[test]
    fn test_only_low_priority_is_batchable() {
        assert!(Priority::Low.is_batchable());
        assert!(!Priority::Normal.is_batchable());
        assert!(!Priority::Critical.is_batchable());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("stream_"));
    }

    #[test]
    fn test_envelope_tagged_json() {
        let env = Envelope::StreamAck {
            session_id: SessionId("stream_01".to_string()),
            seq: 7,
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"stream_ack\""));

        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_created_at_not_transmitted() {
        let msg = Message::new("svc", b"hi".to_vec(), Priority::High, Duration::from_secs(9));
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.created_at, Duration::ZERO);
        assert_eq!(back.payload, b"hi");
    }
}
