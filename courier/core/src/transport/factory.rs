//! Transport Factory
//!
//! Creates connected channels from [`ChannelDescriptor`]s, so callers never
//! name a concrete transport variant.

use super::channel::StreamChannel;
use super::config::{ChannelDescriptor, ChannelEndpoint, PerformanceConfig};
use super::traits::TransportError;

/// Connect the channel a descriptor describes
///
/// # Errors
///
/// Returns `TransportError::ConnectionFailed` if:
/// - a TCP descriptor has no address
/// - the endpoint cannot be reached
/// - an IPC channel is requested on a platform without Unix sockets
///
/// # Example
///
/// ```ignore
/// let descriptor = ChannelDescriptor::tcp("orchestrator-tcp", "127.0.0.1:7400");
/// let channel = connect_channel(&descriptor, &PerformanceConfig::default()).await?;
/// ```
pub async fn connect_channel(
    descriptor: &ChannelDescriptor,
    performance: &PerformanceConfig,
) -> Result<StreamChannel, TransportError> {
    match descriptor.endpoint()? {
        ChannelEndpoint::Tcp(address) => {
            StreamChannel::connect_tcp(descriptor.id.clone(), &address, performance).await
        }

        #[cfg(unix)]
        ChannelEndpoint::Ipc(path) => {
            StreamChannel::connect_ipc(descriptor.id.clone(), &path, performance).await
        }

        #[cfg(not(unix))]
        ChannelEndpoint::Ipc(path) => Err(TransportError::ConnectionFailed(format!(
            "IPC channel {path:?} requires Unix domain sockets"
        ))),
    }
}
