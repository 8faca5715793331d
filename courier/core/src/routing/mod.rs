#![allow(missing_docs)]
//! Channel Routing
//!
//! Learns which channel serves each destination best and routes around
//! channels whose circuit breaker is open.
//!
//! ```text
//! +------------------+
//! |  ChannelRouter   |  <-- select_channel(destination)
//! +--------+---------+
//!          |
//!    +-----+------+
//!    |            |
//!    v            v
//! +-------+  +------------+
//! | Cache |  | ScoreTable |  <-- EMA of latency / errors / load
//! +-------+  +------------+
//! ```

pub mod config;
pub mod router;
pub mod score;

pub use config::{RoutingConfig, ScoreWeights};
pub use router::{ChannelRouter, LoadGuard, RoutingEntry};
pub use score::NEUTRAL_SCORE;
