//! Channel Listener
//!
//! Accepts inbound TCP or IPC connections and wraps each one in a
//! [`StreamChannel`]. The accepting side registers those channels with the
//! delivery core just like outbound ones.
//!
//! # Security
//!
//! - IPC socket files are created with 0600 permissions
//! - Stale socket files are removed before binding

use std::path::PathBuf;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use super::channel::StreamChannel;
use super::config::PerformanceConfig;
use super::traits::{ChannelId, ChannelKind, TransportError};

/// Listener for inbound channels
#[derive(Debug)]
pub enum ChannelListener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix domain socket listener
    #[cfg(unix)]
    Ipc {
        /// Bound listener
        listener: UnixListener,
        /// Socket file, removed on drop
        path: PathBuf,
    },
}

impl ChannelListener {
    /// Bind a TCP listener
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IoError` if the address cannot be bound.
    pub async fn bind_tcp(address: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!(address = %address, "Listening for TCP channels");
        Ok(Self::Tcp(listener))
    }

    /// Bind a Unix domain socket listener
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IoError` if the directory cannot be created,
    /// a stale socket cannot be removed, or the socket cannot be bound.
    #[cfg(unix)]
    pub fn bind_ipc(path: impl Into<PathBuf>) -> Result<Self, TransportError> {
        use std::os::unix::fs::PermissionsExt;

        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            tracing::warn!(path = ?path, "Removing stale socket file");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

        tracing::info!(path = ?path, "Listening for IPC channels");
        Ok(Self::Ipc { listener, path })
    }

    /// Transport variant of accepted channels
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Tcp(_) => ChannelKind::Tcp,
            #[cfg(unix)]
            Self::Ipc { .. } => ChannelKind::Ipc,
        }
    }

    /// Human-readable local endpoint
    #[must_use]
    pub fn local_endpoint(&self) -> String {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string()),
            #[cfg(unix)]
            Self::Ipc { path, .. } => path.display().to_string(),
        }
    }

    /// Accept the next inbound channel
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IoError` if accepting fails.
    pub async fn accept(
        &self,
        performance: &PerformanceConfig,
    ) -> Result<StreamChannel, TransportError> {
        let id = ChannelId::generate();
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(channel = %id, peer = %peer, "Accepted TCP channel");
                StreamChannel::from_tcp(id, stream, performance)
            }
            #[cfg(unix)]
            Self::Ipc { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                tracing::debug!(channel = %id, "Accepted IPC channel");
                Ok(StreamChannel::from_stream(
                    id,
                    ChannelKind::Ipc,
                    stream,
                    performance,
                ))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Self::Ipc { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
