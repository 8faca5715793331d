//! Byte-Stream Channel
//!
//! The one [`Transport`] implementation shared by every channel variant. A
//! connected byte stream (TCP socket, Unix socket, or an in-memory duplex pipe)
//! is split into halves:
//!
//! - a read task decodes frames and forwards envelopes to the inbound queue
//! - writes happen inline in [`Transport::transmit`] under a lock, so the
//!   caller learns whether the frame actually reached the OS
//!
//! A write that fails (or is cancelled) after part of a frame went out leaves
//! the peer's decoder misaligned, so the channel goes down instead of degraded.
//!
//! # Usage
//!
//! ```ignore
//! let channel = StreamChannel::connect_tcp(ChannelId::new("tcp-1"), "127.0.0.1:7400", &perf).await?;
//! let inbound = channel.take_inbound().expect("first take");
//! channel.transmit(envelope).await?;
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::PerformanceConfig;
use super::frame::{FrameDecoder, FrameEncoder};
use super::traits::{ChannelId, ChannelKind, ChannelState, Transport, TransportError};
use crate::messages::Envelope;

/// Inbound envelopes buffered per channel before the reader applies backpressure
const INBOUND_CAPACITY: usize = 1024;

/// Read buffer size
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// In-memory pipe size for in-process pairs
const DUPLEX_BUFFER_SIZE: usize = 256 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A framed channel over a split async byte stream
pub struct StreamChannel {
    id: ChannelId,
    kind: ChannelKind,
    encoder: FrameEncoder,
    /// Write half; `None` once closed
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    /// Inbound envelopes, handed out once
    inbound: Mutex<Option<mpsc::Receiver<Envelope>>>,
    /// `ChannelState` stored as u8 for atomic access
    state: Arc<AtomicU8>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamChannel {
    /// Wrap already-split stream halves
    ///
    /// Must be called inside a tokio runtime; spawns the read task.
    pub fn from_split<R, W>(
        id: ChannelId,
        kind: ChannelKind,
        reader: R,
        writer: W,
        performance: &PerformanceConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let state = Arc::new(AtomicU8::new(ChannelState::Up.as_u8()));

        let handle = tokio::spawn(read_loop(
            id.clone(),
            reader,
            inbound_tx,
            Arc::clone(&state),
        ));

        Self {
            id,
            kind,
            encoder: FrameEncoder::from_performance(performance),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            inbound: Mutex::new(Some(inbound_rx)),
            state,
            reader: Mutex::new(Some(handle)),
        }
    }

    /// Wrap a bidirectional stream
    pub fn from_stream<S>(
        id: ChannelId,
        kind: ChannelKind,
        stream: S,
        performance: &PerformanceConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(id, kind, reader, writer, performance)
    }

    /// Connect a TCP channel
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the connection cannot be established.
    pub async fn connect_tcp(
        id: ChannelId,
        address: &str,
        performance: &PerformanceConfig,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to connect to {address}: {e}"))
        })?;
        Self::from_tcp(id, stream, performance)
    }

    /// Wrap an established TCP stream (connected or accepted)
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IoError` if socket options cannot be applied.
    pub fn from_tcp(
        id: ChannelId,
        stream: TcpStream,
        performance: &PerformanceConfig,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(performance.tcp_nodelay)?;
        let (reader, writer) = stream.into_split();

        tracing::info!(channel = %id, nodelay = performance.tcp_nodelay, "TCP channel connected");
        Ok(Self::from_split(id, ChannelKind::Tcp, reader, writer, performance))
    }

    /// Connect an IPC channel over a Unix domain socket
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the socket cannot be reached.
    #[cfg(unix)]
    pub async fn connect_ipc(
        id: ChannelId,
        path: &Path,
        performance: &PerformanceConfig,
    ) -> Result<Self, TransportError> {
        let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to connect to {path:?}: {e}"))
        })?;
        let (reader, writer) = stream.into_split();

        tracing::info!(channel = %id, path = ?path, "IPC channel connected");
        Ok(Self::from_split(id, ChannelKind::Ipc, reader, writer, performance))
    }

    /// Create two connected channels backed by an in-memory pipe
    ///
    /// Used for embedded deployments where both ends live in one process.
    #[must_use]
    pub fn in_process_pair(
        local: ChannelId,
        remote: ChannelId,
        kind: ChannelKind,
        performance: &PerformanceConfig,
    ) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        (
            Self::from_stream(local, kind, a, performance),
            Self::from_stream(remote, kind, b, performance),
        )
    }

    fn set_state(&self, state: ChannelState) {
        // Down is terminal
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (ChannelState::from_u8(current) != ChannelState::Down).then_some(state.as_u8())
            });
    }
}

#[async_trait]
impl Transport for StreamChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn health(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    async fn transmit(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.health() == ChannelState::Down {
            return Err(TransportError::ConnectionClosed);
        }

        let frame = self.encoder.encode(&envelope)?;

        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or(TransportError::ConnectionClosed)?;

        // Marks the channel down if dropped mid-frame, including on cancellation
        let mut progress = FrameProgress::new(&self.id, &self.state, frame.len());
        let result = async {
            while progress.written < frame.len() {
                let n = writer.write(&frame[progress.written..]).await?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero));
                }
                progress.written += n;
            }
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                progress.finish();
                self.set_state(ChannelState::Up);
                Ok(())
            }
            Err(e) if !progress.is_torn() => {
                progress.finish();
                tracing::warn!(channel = %self.id, error = %e, "Write failed");
                self.set_state(ChannelState::Degraded);
                Err(TransportError::IoError(e))
            }
            Err(e) => {
                // The peer holds a partial frame; nothing written after it can be decoded
                tracing::warn!(channel = %self.id, error = %e, "Write failed mid-frame");
                *slot = None;
                Err(TransportError::IoError(e))
            }
        }
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inbound.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state
            .store(ChannelState::Down.as_u8(), Ordering::Release);

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }

        tracing::info!(channel = %self.id, "Channel closed");
        Ok(())
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.health())
            .finish()
    }
}

/// Tracks how much of one frame reached the stream
///
/// Dropped before [`finish`](Self::finish) with only part of the frame
/// written, it marks the channel down.
struct FrameProgress<'a> {
    id: &'a ChannelId,
    state: &'a AtomicU8,
    len: usize,
    written: usize,
    finished: bool,
}

impl<'a> FrameProgress<'a> {
    fn new(id: &'a ChannelId, state: &'a AtomicU8, len: usize) -> Self {
        Self {
            id,
            state,
            len,
            written: 0,
            finished: false,
        }
    }

    fn is_torn(&self) -> bool {
        self.written > 0 && self.written < self.len
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for FrameProgress<'_> {
    fn drop(&mut self) {
        if !self.finished && self.is_torn() {
            self.state
                .store(ChannelState::Down.as_u8(), Ordering::Release);
            tracing::warn!(
                channel = %self.id,
                written = self.written,
                "Frame write interrupted, channel marked down"
            );
        }
    }
}

/// Read task: stream -> decoder -> inbound queue
async fn read_loop<R>(
    id: ChannelId,
    mut reader: R,
    inbound: mpsc::Sender<Envelope>,
    state: Arc<AtomicU8>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(channel = %id, "Connection closed by peer");
                break;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);

                loop {
                    match decoder.decode::<Envelope>() {
                        Ok(Some(envelope)) => {
                            if inbound.send(envelope).await.is_err() {
                                tracing::debug!(channel = %id, "Inbound receiver dropped");
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(TransportError::FrameTooLarge { size, max }) => {
                            tracing::warn!(channel = %id, size, max, "Oversized frame, dropping connection");
                            break 'read;
                        }
                        Err(e) => {
                            // Corrupt frame was skipped; keep reading
                            tracing::warn!(channel = %id, error = %e, "Frame decode error");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(channel = %id, error = %e, "Read error");
                break;
            }
        }
    }

    state.store(ChannelState::Down.as_u8(), Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Priority, RequestId};
    use std::time::Duration;
    use tempfile::TempDir;

    fn ping(id: u64) -> Envelope {
        Envelope::Request {
            request_id: RequestId(id),
            message: Message::new("peer", b"ping".to_vec(), Priority::Normal, Duration::ZERO),
        }
    }

    #[tokio::test]
    async fn test_in_process_pair_delivers_both_ways() {
        let perf = PerformanceConfig::default();
        let (a, b) = StreamChannel::in_process_pair(
            ChannelId::new("a"),
            ChannelId::new("b"),
            ChannelKind::Ipc,
            &perf,
        );
        let mut a_in = a.take_inbound().unwrap();
        let mut b_in = b.take_inbound().unwrap();

        a.transmit(ping(1)).await.unwrap();
        assert!(matches!(
            b_in.recv().await,
            Some(Envelope::Request { request_id: RequestId(1), .. })
        ));

        b.transmit(ping(2)).await.unwrap();
        assert!(matches!(
            a_in.recv().await,
            Some(Envelope::Request { request_id: RequestId(2), .. })
        ));
    }

    #[tokio::test]
    async fn test_take_inbound_only_once() {
        let perf = PerformanceConfig::default();
        let (a, _b) = StreamChannel::in_process_pair(
            ChannelId::new("a"),
            ChannelId::new("b"),
            ChannelKind::Tcp,
            &perf,
        );
        assert!(a.take_inbound().is_some());
        assert!(a.take_inbound().is_none());
    }

    #[tokio::test]
    async fn test_transmit_after_close_fails() {
        let perf = PerformanceConfig::default();
        let (a, _b) = StreamChannel::in_process_pair(
            ChannelId::new("a"),
            ChannelId::new("b"),
            ChannelKind::Tcp,
            &perf,
        );
        a.close().await.unwrap();
        assert_eq!(a.health(), ChannelState::Down);
        assert!(matches!(
            a.transmit(ping(1)).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_marks_channel_down() {
        let perf = PerformanceConfig::default();
        let (a, b) = StreamChannel::in_process_pair(
            ChannelId::new("a"),
            ChannelId::new("b"),
            ChannelKind::Ipc,
            &perf,
        );
        let mut a_in = a.take_inbound().unwrap();
        drop(b);

        // Reader sees EOF and closes the inbound queue
        assert!(a_in.recv().await.is_none());
        assert_eq!(a.health(), ChannelState::Down);
    }

    #[tokio::test]
    async fn test_interrupted_write_marks_channel_down() {
        let perf = PerformanceConfig::default();
        // Far end stays open but is never read, so the pipe fills up
        let (near, _far) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(near);
        let a = StreamChannel::from_split(ChannelId::new("a"), ChannelKind::Tcp, reader, writer, &perf);

        let big = Envelope::Request {
            request_id: RequestId(1),
            message: Message::new("peer", vec![7; 256], Priority::Normal, Duration::ZERO),
        };
        let stalled = tokio::time::timeout(Duration::from_millis(50), a.transmit(big)).await;
        assert!(stalled.is_err());

        assert_eq!(a.health(), ChannelState::Down);
        assert!(matches!(
            a.transmit(ping(2)).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_tcp_channel_roundtrip() {
        let perf = PerformanceConfig::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            StreamChannel::from_tcp(ChannelId::new("server"), stream, &PerformanceConfig::default())
                .unwrap()
        });

        let client = StreamChannel::connect_tcp(ChannelId::new("client"), &addr, &perf)
            .await
            .unwrap();
        let server = accept.await.unwrap();
        let mut server_in = server.take_inbound().unwrap();

        client.transmit(ping(9)).await.unwrap();
        assert!(matches!(
            server_in.recv().await,
            Some(Envelope::Request { request_id: RequestId(9), .. })
        ));
        assert_eq!(client.kind(), ChannelKind::Tcp);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ipc_channel_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("courier.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            StreamChannel::from_stream(
                ChannelId::new("server"),
                ChannelKind::Ipc,
                stream,
                &PerformanceConfig::default(),
            )
        });

        let client =
            StreamChannel::connect_ipc(ChannelId::new("client"), &path, &PerformanceConfig::default())
                .await
                .unwrap();
        let server = accept.await.unwrap();
        let mut client_in = client.take_inbound().unwrap();

        server.transmit(ping(3)).await.unwrap();
        assert!(matches!(
            client_in.recv().await,
            Some(Envelope::Request { request_id: RequestId(3), .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        // Port 1 on localhost is essentially never listening
        let result = StreamChannel::connect_tcp(
            ChannelId::new("nowhere"),
            "127.0.0.1:1",
            &PerformanceConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
