//! Transport Configuration
//!
//! Channel descriptors (what to connect to) and per-connection performance
//! tuning shared by every channel.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::traits::{ChannelId, ChannelKind, TransportError};

/// Low-level tuning applied to every channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Compress frame payloads above `compression_threshold`
    pub enable_compression: bool,

    /// Payload size in bytes above which frames are compressed
    pub compression_threshold: usize,

    /// Disable Nagle's algorithm on TCP channels
    pub tcp_nodelay: bool,

    /// Longest a single transmit attempt may take before it counts as a
    /// transient failure
    #[serde(rename = "attempt_timeout_ms", with = "crate::config::duration_ms")]
    pub attempt_timeout: Duration,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            compression_threshold: 4096,
            tcp_nodelay: true,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Where a channel connects to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEndpoint {
    /// TCP `host:port`
    Tcp(String),
    /// Unix domain socket path
    Ipc(PathBuf),
}

/// Description of one transport, as passed to `register_channel`
///
/// # Example (TOML)
///
/// ```toml
/// [[channels]]
/// id = "orchestrator-tcp"
/// kind = "tcp"
/// address = "127.0.0.1:7400"
/// destinations = ["orchestrator"]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Unique channel id
    pub id: ChannelId,

    /// Transport variant
    pub kind: ChannelKind,

    /// TCP address (`host:port`), required for `tcp`
    #[serde(default)]
    pub address: Option<String>,

    /// Socket path for `ipc` (None = default socket path)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Destinations reachable over this channel (empty = all)
    #[serde(default)]
    pub destinations: Vec<String>,
}

impl ChannelDescriptor {
    /// Describe a TCP channel
    pub fn tcp(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: ChannelId::new(id),
            kind: ChannelKind::Tcp,
            address: Some(address.into()),
            path: None,
            destinations: Vec::new(),
        }
    }

    /// Describe an IPC channel
    pub fn ipc(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: ChannelId::new(id),
            kind: ChannelKind::Ipc,
            address: None,
            path: Some(path.into()),
            destinations: Vec::new(),
        }
    }

    /// Restrict the channel to the given destinations
    #[must_use]
    pub fn with_destinations<I, S>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destinations = destinations.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve the endpoint to connect to
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` when a TCP descriptor has no address.
    pub fn endpoint(&self) -> Result<ChannelEndpoint, TransportError> {
        match self.kind {
            ChannelKind::Tcp => self
                .address
                .clone()
                .map(ChannelEndpoint::Tcp)
                .ok_or_else(|| {
                    TransportError::ConnectionFailed(format!(
                        "channel {} is tcp but has no address",
                        self.id
                    ))
                }),
            ChannelKind::Ipc => Ok(ChannelEndpoint::Ipc(
                self.path.clone().unwrap_or_else(default_socket_path),
            )),
        }
    }
}

/// Get the default IPC socket path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/courier-$UID/`
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("courier").join("courier.sock")
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/courier-{uid}/courier.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_descriptor_endpoint() {
        let desc = ChannelDescriptor::tcp("tcp-1", "127.0.0.1:7400");
        assert_eq!(
            desc.endpoint().unwrap(),
            ChannelEndpoint::Tcp("127.0.0.1:7400".to_string())
        );
    }

    #[test]
    fn test_tcp_descriptor_without_address_fails() {
        let mut desc = ChannelDescriptor::tcp("tcp-1", "ignored");
        desc.address = None;
        assert!(matches!(
            desc.endpoint(),
            Err(TransportError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_ipc_descriptor_falls_back_to_default_path() {
        let mut desc = ChannelDescriptor::ipc("ipc-1", "/tmp/x.sock");
        desc.path = None;
        match desc.endpoint().unwrap() {
            ChannelEndpoint::Ipc(path) => assert!(path.ends_with("courier.sock")),
            ChannelEndpoint::Tcp(_) => panic!("expected ipc endpoint"),
        }
    }

    #[test]
    fn test_descriptor_from_toml() {
        let desc: ChannelDescriptor = toml::from_str(
            r#"
            id = "orchestrator-ipc"
            kind = "ipc"
            path = "/run/courier.sock"
            destinations = ["orchestrator"]
            "#,
        )
        .unwrap();
        assert_eq!(desc.kind, ChannelKind::Ipc);
        assert_eq!(desc.destinations, vec!["orchestrator".to_string()]);
    }
}
