//! Courier Core - Resilient Multi-Transport Message Delivery
//!
//! This crate exchanges requests, responses and large payloads with a peer
//! over interchangeable transports (TCP and a local Unix-socket channel). It
//! picks the healthiest transport per destination, isolates failing ones,
//! multiplexes concurrent requests over shared channels, streams large
//! payloads with windowed flow control, and reports per-channel health
//! against service-level objectives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Courier                               │
//! │  send / post / open_stream            incoming / metrics / SLA   │
//! │       │                                        ▲                 │
//! │  ┌────▼──────────────┐   ┌──────────────┐   ┌──┴──────────────┐  │
//! │  │ PriorityMessage   │   │ ChannelRouter│   │ Performance     │  │
//! │  │ Queue             ├──►│ (scores,     │   │ Monitor         │  │
//! │  └───────────────────┘   │  cache)      │   │ (SLA, alerts)   │  │
//! │                          └──────┬───────┘   └──▲──────────────┘  │
//! │  ┌───────────────────┐   ┌──────▼──────────────┴──────────────┐  │
//! │  │ RequestMultiplexer│◄──┤ FailoverManager                    │  │
//! │  └───────────────────┘   │ CircuitBreaker · Retry · Batcher   │  │
//! │  ┌───────────────────┐   └──────┬─────────────────────────────┘  │
//! │  │ StreamEngine      ├──────────┤                                │
//! │  └───────────────────┘          │                                │
//! └─────────────────────────────────┼────────────────────────────────┘
//!                                   │ framed Envelopes
//!                         ┌─────────┴─────────┐
//!                         │ TCP │ IPC (Unix)  │
//!                         └───────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Courier`]: owns every component and the background tasks
//! - [`Transport`]: the channel capability interface; [`StreamChannel`]
//!   implements it for TCP, Unix sockets and in-memory pipes
//! - [`DeliveryError`]: everything a caller can observe going wrong
//! - [`Clock`]: injectable monotonic time behind every timeout
//!
//! # Quick Start
//!
//! ```ignore
//! use courier_core::{
//!     config::load_config, clock::SystemClock, Courier, Priority,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let courier = Courier::new(config.clone(), SystemClock::shared());
//!
//!     for descriptor in &config.channels {
//!         courier.register_channel(descriptor).await?;
//!     }
//!
//!     let response = courier
//!         .send("orchestrator", b"ping".to_vec(), Priority::High)
//!         .await?;
//!     println!("{} bytes via {}", response.payload.len(), response.channel_id);
//!
//!     courier.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`clock`]: monotonic clock abstraction
//! - [`compression`]: zlib helpers shared by frames and streams
//! - [`config`]: TOML configuration with environment overrides
//! - [`courier`]: the delivery context
//! - [`error`]: delivery error taxonomy
//! - [`failover`]: circuit breaker, retry, batching, failover manager
//! - [`messages`]: messages, ids and the wire envelope
//! - [`monitor`]: metrics windows, SLA evaluation and alerts
//! - [`multiplexer`]: request/response correlation
//! - [`queue`]: strict-priority outbound queue
//! - [`routing`]: score-based channel selection
//! - [`streaming`]: chunked, windowed stream transfer
//! - [`transport`]: channels, framing and listeners

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod compression;
pub mod config;
pub mod courier;
pub mod error;
pub mod failover;
pub mod messages;
pub mod monitor;
pub mod multiplexer;
pub mod queue;
pub mod routing;
pub mod streaming;
pub mod transport;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use courier::{Courier, Incoming};
pub use error::{AbortInitiator, DeliveryError, Result};
pub use messages::{Envelope, Message, MessageId, Priority, RequestId, Response, SessionId};

// Failover exports
pub use failover::{
    BatchConfig, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
    FailoverConfig, FailoverManager, RetryConfig, RetryExecutor,
};

// Monitoring exports
pub use monitor::{
    AlertConfig, AlertEvent, AlertKind, AlertState, ChannelMetric, MetricSample, MonitorConfig,
    PerformanceComparison, PerformanceMonitor, SlaConfig, SlaStatus,
};

// Routing, queueing and multiplexing exports
pub use multiplexer::{MultiplexerConfig, PendingResponse, RequestMultiplexer};
pub use queue::{PriorityMessageQueue, QueueConfig};
pub use routing::{ChannelRouter, RoutingConfig, RoutingEntry};

// Streaming exports
pub use streaming::{
    CompletedStream, EnvelopeSink, StreamConfig, StreamEngine, StreamMetadata, StreamSender,
    StreamSummary,
};

// Transport exports
pub use transport::{
    connect_channel, ChannelDescriptor, ChannelId, ChannelKind, ChannelListener, ChannelState,
    PerformanceConfig, StreamChannel, Transport, TransportError,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    CourierConfig,
};
