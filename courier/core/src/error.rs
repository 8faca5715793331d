//! Delivery Errors
//!
//! One error type for everything a caller of the delivery core can observe.
//! Transient failures are retried inside the failover path; everything else
//! surfaces on the first occurrence.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{Priority, RequestId, SessionId};
use crate::transport::{ChannelId, TransportError};

/// Which side tore a stream down
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortInitiator {
    /// This process aborted the stream
    Local,
    /// The peer sent an abort
    Peer,
}

impl fmt::Display for AbortInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Peer => write!(f, "peer"),
        }
    }
}

/// Errors surfaced by the delivery core
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Retryable transport failure (timeout, connection reset)
    #[error("transient failure on channel {channel_id}: {reason}")]
    Transient {
        /// Channel the failure happened on
        channel_id: ChannelId,
        /// What went wrong
        reason: String,
    },

    /// Non-retryable failure (validation, serialization)
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The channel's circuit breaker is open
    #[error("circuit open for channel {channel_id}, retry after {retry_after:?}")]
    CircuitOpen {
        /// Channel whose breaker rejected the call
        channel_id: ChannelId,
        /// Estimated time until the breaker admits a trial request
        retry_after: Duration,
    },

    /// Every retry attempt failed
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        last: Box<DeliveryError>,
    },

    /// The priority tier is at capacity
    #[error("{priority} priority queue is full (capacity {capacity})")]
    QueueFull {
        /// Tier that rejected the message
        priority: Priority,
        /// Tier capacity
        capacity: usize,
    },

    /// No response before the request deadline
    #[error("request {request_id} timed out after {after:?}")]
    TimedOut {
        /// Request that expired
        request_id: RequestId,
        /// Configured request timeout
        after: Duration,
    },

    /// A stream session was aborted
    #[error("stream {session_id} aborted by {initiator}: {reason}")]
    StreamAborted {
        /// Aborted session
        session_id: SessionId,
        /// Reason code
        reason: String,
        /// Which side aborted
        initiator: AbortInitiator,
    },

    /// No registered channel can reach the destination
    #[error("no available channel for destination {destination}")]
    NoChannel {
        /// Requested destination
        destination: String,
    },

    /// Channel id is not registered
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The peer answered with an error
    #[error("peer reported failure: {0}")]
    Remote(String),

    /// The delivery core is shutting down
    #[error("delivery core is shutting down")]
    Shutdown,
}

impl DeliveryError {
    /// Whether the retry executor may try again
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::TimedOut { .. })
    }

    /// Whether the router may try an alternate channel for the same destination
    ///
    /// A timed-out request may already be executing on the peer, so it is
    /// not replayed elsewhere.
    #[must_use]
    pub fn allows_failover(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RetryExhausted { .. } | Self::Transient { .. }
        )
    }

    /// Classify a transport failure on `channel_id`
    #[must_use]
    pub fn from_transport(channel_id: &ChannelId, err: TransportError) -> Self {
        if err.is_transient() {
            Self::Transient {
                channel_id: channel_id.clone(),
                reason: err.to_string(),
            }
        } else {
            Self::Permanent(err.to_string())
        }
    }

    /// The innermost cause, looking through `RetryExhausted`
    #[must_use]
    pub fn root_cause(&self) -> &DeliveryError {
        match self {
            Self::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

/// Result alias for delivery operations
pub type Result<T, E = DeliveryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_transport_errors_classified() {
        let id = ChannelId::new("tcp-1");

        let reset = DeliveryError::from_transport(
            &id,
            TransportError::IoError(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        );
        assert!(reset.is_transient());

        let bad = DeliveryError::from_transport(
            &id,
            TransportError::SerializationError("bad json".into()),
        );
        assert!(matches!(bad, DeliveryError::Permanent(_)));
        assert!(!bad.is_transient());
    }

    #[test]
    fn test_retry_exhausted_keeps_cause() {
        let err = DeliveryError::RetryExhausted {
            attempts: 3,
            last: Box::new(DeliveryError::Transient {
                channel_id: ChannelId::new("ipc-1"),
                reason: "reset".into(),
            }),
        };

        assert!(err.to_string().contains("3 attempts"));
        assert!(err.source().is_some());
        assert!(matches!(err.root_cause(), DeliveryError::Transient { .. }));
        assert!(err.allows_failover());
    }

    #[test]
    fn test_permanent_and_backpressure_do_not_fail_over() {
        assert!(!DeliveryError::Permanent("invalid".into()).allows_failover());
        assert!(!DeliveryError::QueueFull {
            priority: Priority::Low,
            capacity: 10
        }
        .allows_failover());
    }
}
