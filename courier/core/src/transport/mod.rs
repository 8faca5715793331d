//! Transport Layer
//!
//! Channels carry framed [`Envelope`](crate::messages::Envelope)s between this
//! process and a peer. Two interchangeable variants exist:
//! - `Tcp`: a TCP socket (`TCP_NODELAY` configurable)
//! - `Ipc`: a local pipe-style channel over a Unix domain socket
//!
//! Both share one implementation, [`StreamChannel`], behind the [`Transport`]
//! capability interface `{transmit, health, close}`.
//!
//! # Security
//!
//! - IPC socket files are created with 0600 permissions
//! - Frame sizes are bounded before any allocation
//! - CRC32 checksums detect corruption in transit

pub mod channel;
pub mod config;
pub mod factory;
pub mod frame;
pub mod listener;
pub mod traits;

// Re-exports for convenience
pub use channel::StreamChannel;
pub use config::{default_socket_path, ChannelDescriptor, ChannelEndpoint, PerformanceConfig};
pub use factory::connect_channel;
pub use frame::{FrameDecoder, FrameEncoder, MAX_FRAME_SIZE};
pub use listener::ChannelListener;
pub use traits::{ChannelId, ChannelKind, ChannelState, Transport, TransportError};
