//! Daemon Server
//!
//! Accepts inbound channels on the configured listeners, registers each one
//! with the [`Courier`], and answers peer traffic. Requests are echoed back
//! when `echo_requests` is set and refused otherwise; messages and completed
//! streams are logged.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use courier_core::{ChannelListener, Courier, Incoming, Transport};

/// Server tuning
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Registered channels above which new connections are refused
    pub max_channels: usize,
    /// Answer requests with their own payload
    pub echo_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_channels: 64,
            echo_requests: true,
        }
    }
}

/// Listener set bound to one courier
pub struct DaemonServer {
    courier: Arc<Courier>,
    listeners: Vec<ChannelListener>,
    config: ServerConfig,
}

impl DaemonServer {
    pub fn new(courier: Arc<Courier>, config: ServerConfig) -> Self {
        Self {
            courier,
            listeners: Vec::new(),
            config,
        }
    }

    /// Bind a TCP listener; returns the bound address
    pub async fn listen_tcp(&mut self, address: &str) -> Result<String> {
        let listener = ChannelListener::bind_tcp(address)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {address}"))?;
        let endpoint = listener.local_endpoint();
        self.listeners.push(listener);
        Ok(endpoint)
    }

    /// Bind a Unix socket listener; returns the socket path
    #[cfg(unix)]
    pub fn listen_ipc(&mut self, path: &Path) -> Result<String> {
        let listener = ChannelListener::bind_ipc(path)
            .with_context(|| format!("Failed to bind IPC listener at {}", path.display()))?;
        let endpoint = listener.local_endpoint();
        self.listeners.push(listener);
        Ok(endpoint)
    }

    /// Number of bound listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Serve until `shutdown` is notified
    ///
    /// Listeners are dropped on return, which removes their socket files.
    pub async fn run(self, shutdown: Arc<Notify>) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let incoming = self
            .courier
            .incoming()
            .context("Incoming stream already taken")?;
        tasks.push(tokio::spawn(handle_incoming(
            Arc::clone(&self.courier),
            incoming,
            self.config.echo_requests,
        )));

        for listener in self.listeners {
            let endpoint = listener.local_endpoint();
            let kind = listener.kind();
            tasks.push(tokio::spawn(
                accept_loop(
                    Arc::clone(&self.courier),
                    listener,
                    self.config.max_channels,
                )
                .instrument(tracing::info_span!("listener", %kind, %endpoint)),
            ));
        }

        info!("Ready to accept channels");
        shutdown.notified().await;
        info!("Stopping listeners");

        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

async fn accept_loop(courier: Arc<Courier>, listener: ChannelListener, max_channels: usize) {
    let performance = courier.config().failover.performance.clone();

    loop {
        let channel = match listener.accept(&performance).await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Accept failed");
                continue;
            }
        };

        let channel_id = channel.id().clone();
        if courier.channel_ids().len() >= max_channels {
            warn!(channel = %channel_id, "Channel limit reached, refusing connection");
            if let Err(e) = channel.close().await {
                debug!(channel = %channel_id, error = %e, "Close after refusal failed");
            }
            continue;
        }

        match courier.register_transport(Arc::new(channel), Vec::new()) {
            Ok(()) => info!(
                channel = %channel_id,
                active_channels = courier.channel_ids().len(),
                "Channel accepted"
            ),
            Err(e) => warn!(channel = %channel_id, error = %e, "Failed to register channel"),
        }
    }
}

async fn handle_incoming<S>(courier: Arc<Courier>, mut incoming: S, echo_requests: bool)
where
    S: futures::Stream<Item = Incoming> + Unpin,
{
    while let Some(item) = incoming.next().await {
        match item {
            Incoming::Request {
                channel_id,
                request_id,
                message,
            } => {
                debug!(
                    channel = %channel_id,
                    request = %request_id,
                    destination = %message.destination,
                    bytes = message.payload.len(),
                    "Request received"
                );
                let result = if echo_requests {
                    courier.respond(&channel_id, request_id, message.payload).await
                } else {
                    courier
                        .respond_error(&channel_id, request_id, "no handler for requests")
                        .await
                };
                if let Err(e) = result {
                    warn!(channel = %channel_id, error = %e, "Failed to answer request");
                }
            }
            Incoming::Message {
                channel_id,
                message,
            } => {
                debug!(
                    channel = %channel_id,
                    id = %message.id,
                    priority = %message.priority,
                    bytes = message.payload.len(),
                    "Message received"
                );
            }
            Incoming::Stream(stream) => {
                info!(
                    channel = %stream.channel_id,
                    session = %stream.session_id,
                    content_type = %stream.metadata.content_type,
                    bytes = stream.data.len(),
                    "Stream received"
                );
            }
        }
    }
    debug!("Incoming stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{CourierConfig, Priority, StreamChannel, SystemClock};
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_echoes_requests() {
        let courier = Arc::new(Courier::new(CourierConfig::default(), SystemClock::shared()));
        let mut server = DaemonServer::new(Arc::clone(&courier), ServerConfig::default());
        let endpoint = server.listen_tcp("127.0.0.1:0").await.unwrap();
        assert_eq!(server.listener_count(), 1);

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(server.run(Arc::clone(&shutdown)));

        let client = Courier::new(CourierConfig::default(), SystemClock::shared());
        let performance = client.config().failover.performance.clone();
        let channel = StreamChannel::connect_tcp("client".into(), &endpoint, &performance)
            .await
            .unwrap();
        client
            .register_transport(Arc::new(channel), vec!["daemon".to_string()])
            .unwrap();

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            client.send("daemon", b"ping".to_vec(), Priority::High),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(response.payload, b"ping");

        client.shutdown().await;
        shutdown.notify_one();
        handle.await.unwrap().unwrap();
        courier.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_refuses_requests_without_echo() {
        let courier = Arc::new(Courier::new(CourierConfig::default(), SystemClock::shared()));
        let config = ServerConfig {
            echo_requests: false,
            ..ServerConfig::default()
        };
        let mut server = DaemonServer::new(Arc::clone(&courier), config);
        let endpoint = server.listen_tcp("127.0.0.1:0").await.unwrap();

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(server.run(Arc::clone(&shutdown)));

        let client = Courier::new(CourierConfig::default(), SystemClock::shared());
        let performance = client.config().failover.performance.clone();
        let channel = StreamChannel::connect_tcp("client".into(), &endpoint, &performance)
            .await
            .unwrap();
        client
            .register_transport(Arc::new(channel), Vec::new())
            .unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.send("daemon", b"ping".to_vec(), Priority::Normal),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.to_string().contains("no handler"), "{err}");

        client.shutdown().await;
        shutdown.notify_one();
        handle.await.unwrap().unwrap();
        courier.shutdown().await;
    }
}
