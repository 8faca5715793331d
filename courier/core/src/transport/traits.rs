//! Transport Traits
//!
//! The fixed capability interface every channel implements. Channels are a
//! closed set of variants (TCP and local IPC, see [`ChannelKind`]) sharing one
//! implementation over split byte streams; the trait exists so the failover
//! path can be exercised against scripted transports in tests.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::messages::Envelope;

/// Unique identifier for a registered channel
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Create a channel id from a name
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random channel id (used for accepted connections)
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 8] = rand::thread_rng().gen();
        Self(format!("chan_{}", hex::encode(bytes)))
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// TCP socket
    Tcp,
    /// Local pipe-style channel (Unix domain socket)
    Ipc,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Ipc => write!(f, "ipc"),
        }
    }
}

/// Connection-level health of a channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Connected and the last write succeeded
    #[default]
    Up,
    /// Connected but the last write failed
    Degraded,
    /// Closed, or the peer went away
    Down,
}

impl ChannelState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Up => 0,
            Self::Degraded => 1,
            Self::Down => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Up,
            1 => Self::Degraded,
            _ => Self::Down,
        }
    }
}

/// Errors that can occur during transport operations
#[derive(Debug)]
pub enum TransportError {
    /// Connection to peer failed
    ConnectionFailed(String),
    /// Connection was closed
    ConnectionClosed,
    /// Failed to send a frame
    SendFailed(String),
    /// Frame serialization/deserialization error
    SerializationError(String),
    /// Frame larger than the protocol allows
    FrameTooLarge {
        /// Size of the offending payload
        size: usize,
        /// Configured maximum
        max: usize,
    },
    /// IO error from underlying transport
    IoError(std::io::Error),
    /// Frame checksum mismatch - data corruption detected
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value received
        actual: u32,
    },
}

impl TransportError {
    /// Whether retrying the same frame could succeed
    ///
    /// Connection and IO problems are transient; a frame that cannot be
    /// encoded will fail identically on every attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionClosed
                | Self::SendFailed(_)
                | Self::IoError(_)
                | Self::ChecksumMismatch { .. }
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::SerializationError(msg) => write!(f, "Serialization error: {msg}"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {size} bytes (max: {max})")
            }
            Self::IoError(e) => write!(f, "IO error: {e}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "Checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            ),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

/// A bidirectional channel carrying [`Envelope`] frames
#[async_trait]
pub trait Transport: Send + Sync {
    /// Channel identifier
    fn id(&self) -> &ChannelId;

    /// Transport variant
    fn kind(&self) -> ChannelKind;

    /// Current connection health
    fn health(&self) -> ChannelState;

    /// Write one envelope to the peer
    ///
    /// Resolves once the frame has been handed to the OS, so a failure here
    /// is a real delivery failure for the circuit breaker.
    async fn transmit(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Take the inbound envelope stream
    ///
    /// Returns `Some` exactly once; the response-dispatch task owns it.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>>;

    /// Close the channel. Further transmits fail with `ConnectionClosed`.
    async fn close(&self) -> Result<(), TransportError>;
}
