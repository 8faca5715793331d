//! Outbound stream session

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TryRecvError};

use super::{abort_reason, EnvelopeSink, SendWindow, StreamConfig, StreamMetadata};
use crate::clock::SharedClock;
use crate::compression;
use crate::error::{AbortInitiator, DeliveryError, Result};
use crate::messages::{Envelope, SessionId};

/// Peer feedback routed to an outbound session by the engine
#[derive(Debug)]
pub(crate) enum StreamSignal {
    Ack(u64),
    Abort(String),
}

pub(crate) type SignalRegistry = DashMap<SessionId, mpsc::UnboundedSender<StreamSignal>>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum SenderState {
    Open,
    Closed,
    Aborted {
        reason: String,
        initiator: AbortInitiator,
    },
}

/// Outcome of a completed transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    /// Session that completed
    pub session_id: SessionId,
    /// Payload bytes delivered
    pub total_bytes: u64,
    /// Data chunks sent (the end marker not included)
    pub chunks: u64,
    /// Envelopes resent after an acknowledgment timeout
    pub retransmissions: u64,
}

/// Writing half of a stream session
///
/// `write` blocks while the window is full; that is the stream's
/// backpressure. Dropping an open sender aborts the session.
pub struct StreamSender {
    session_id: SessionId,
    metadata: StreamMetadata,
    config: StreamConfig,
    sink: Arc<dyn EnvelopeSink>,
    clock: SharedClock,
    signals: mpsc::UnboundedReceiver<StreamSignal>,
    registry: Arc<SignalRegistry>,
    window: SendWindow,
    buffer: Vec<u8>,
    bytes_written: u64,
    next_seq: u64,
    state: SenderState,
}

impl StreamSender {
    pub(crate) fn new(
        session_id: SessionId,
        metadata: StreamMetadata,
        config: StreamConfig,
        sink: Arc<dyn EnvelopeSink>,
        clock: SharedClock,
        signals: mpsc::UnboundedReceiver<StreamSignal>,
        registry: Arc<SignalRegistry>,
    ) -> Self {
        Self {
            window: SendWindow::new(config.window_size),
            buffer: Vec::with_capacity(config.max_chunk_size),
            session_id,
            metadata,
            config,
            sink,
            clock,
            signals,
            registry,
            bytes_written: 0,
            next_seq: 0,
            state: SenderState::Open,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Payload bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Envelopes awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    /// Append payload bytes, sending every full chunk
    ///
    /// # Errors
    ///
    /// - `StreamAborted` if the session was aborted by either side, or if
    ///   `data` would exceed the announced `total_size`
    /// - the sink's error if a chunk could not be transmitted
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.bytes_written + data.len() as u64 > self.metadata.total_size {
            return Err(self.fail(abort_reason::SIZE_MISMATCH).await);
        }

        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(data);

        let chunk_size = self.config.max_chunk_size;
        while self.buffer.len() >= chunk_size {
            let rest = self.buffer.split_off(chunk_size);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            self.send_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Flush the final chunk, send the end marker and wait until every
    /// chunk and the marker are acknowledged
    pub async fn close(mut self) -> Result<StreamSummary> {
        self.ensure_open()?;
        if self.bytes_written != self.metadata.total_size {
            tracing::warn!(
                session = %self.session_id,
                written = self.bytes_written,
                announced = self.metadata.total_size,
                "Stream closed short of its announced size"
            );
            return Err(self.fail(abort_reason::SIZE_MISMATCH).await);
        }

        if !self.buffer.is_empty() {
            let chunk = std::mem::take(&mut self.buffer);
            self.send_chunk(chunk).await?;
        }

        let total_chunks = self.next_seq;
        let end = Envelope::StreamEnd {
            session_id: self.session_id.clone(),
            total_chunks,
        };
        self.send_windowed(total_chunks, end).await?;

        while !self.window.is_empty() {
            self.await_progress().await?;
        }

        self.release(SenderState::Closed);
        tracing::debug!(
            session = %self.session_id,
            bytes = self.bytes_written,
            chunks = total_chunks,
            retransmissions = self.window.retransmissions(),
            "Stream completed"
        );

        Ok(StreamSummary {
            session_id: self.session_id.clone(),
            total_bytes: self.bytes_written,
            chunks: total_chunks,
            retransmissions: self.window.retransmissions(),
        })
    }

    /// Tear the session down and tell the peer why
    pub async fn abort(mut self, reason: &str) -> Result<()> {
        self.ensure_open()?;
        self.release(SenderState::Aborted {
            reason: reason.to_string(),
            initiator: AbortInitiator::Local,
        });
        self.sink
            .send_envelope(Envelope::StreamAbort {
                session_id: self.session_id.clone(),
                reason: reason.to_string(),
            })
            .await
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.state {
            SenderState::Open => Ok(()),
            SenderState::Closed => Err(DeliveryError::Permanent(format!(
                "stream {} is already closed",
                self.session_id
            ))),
            SenderState::Aborted { reason, initiator } => Err(DeliveryError::StreamAborted {
                session_id: self.session_id.clone(),
                reason: reason.clone(),
                initiator: *initiator,
            }),
        }
    }

    async fn send_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        let (compressed, data) = self.encode(chunk);
        let seq = self.next_seq;
        self.next_seq += 1;

        let envelope = Envelope::StreamChunk {
            session_id: self.session_id.clone(),
            seq,
            compressed,
            data,
        };
        self.send_windowed(seq, envelope).await
    }

    fn encode(&self, chunk: Vec<u8>) -> (bool, Vec<u8>) {
        if self.config.enable_compression && chunk.len() > self.config.compression_threshold {
            match compression::compress(&chunk) {
                Ok(packed) if packed.len() < chunk.len() => return (true, packed),
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(session = %self.session_id, error = %err, "Chunk compression failed");
                }
            }
        }
        (false, chunk)
    }

    async fn send_windowed(&mut self, seq: u64, envelope: Envelope) -> Result<()> {
        self.drain_signals()?;
        while self.window.is_full() {
            self.await_progress().await?;
        }

        if let Err(err) = self.sink.send_envelope(envelope.clone()).await {
            return Err(self.fail_transport(err).await);
        }
        self.window.insert(seq, envelope, self.clock.now());
        Ok(())
    }

    /// Apply whatever feedback has already arrived
    fn drain_signals(&mut self) -> Result<()> {
        loop {
            match self.signals.try_recv() {
                Ok(signal) => self.apply(signal)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(self.lost()),
            }
        }
    }

    /// Wait for one acknowledgment or the next ack deadline
    async fn await_progress(&mut self) -> Result<()> {
        let ack_timeout = self.config.ack_timeout;
        let wait = self
            .window
            .next_deadline(ack_timeout)
            .map_or(ack_timeout, |deadline| {
                deadline.saturating_sub(self.clock.now())
            });
        let clock = Arc::clone(&self.clock);

        tokio::select! {
            biased;
            signal = self.signals.recv() => match signal {
                Some(signal) => self.apply(signal),
                None => Err(self.lost()),
            },
            () = clock.sleep(wait) => self.retransmit_overdue().await,
        }
    }

    fn apply(&mut self, signal: StreamSignal) -> Result<()> {
        match signal {
            StreamSignal::Ack(seq) => {
                if !self.window.ack(seq) {
                    tracing::trace!(session = %self.session_id, seq, "Duplicate acknowledgment");
                }
                Ok(())
            }
            StreamSignal::Abort(reason) => {
                tracing::info!(session = %self.session_id, %reason, "Stream aborted by peer");
                self.release(SenderState::Aborted {
                    reason: reason.clone(),
                    initiator: AbortInitiator::Peer,
                });
                Err(DeliveryError::StreamAborted {
                    session_id: self.session_id.clone(),
                    reason,
                    initiator: AbortInitiator::Peer,
                })
            }
        }
    }

    async fn retransmit_overdue(&mut self) -> Result<()> {
        let overdue = self.window.take_overdue(
            self.clock.now(),
            self.config.ack_timeout,
            self.config.max_retransmits,
        );

        match overdue {
            Ok(resend) => {
                if !resend.is_empty() {
                    tracing::debug!(
                        session = %self.session_id,
                        count = resend.len(),
                        "Retransmitting unacknowledged window tail"
                    );
                }
                for envelope in resend {
                    if let Err(err) = self.sink.send_envelope(envelope).await {
                        return Err(self.fail_transport(err).await);
                    }
                }
                Ok(())
            }
            Err(seq) => {
                tracing::warn!(
                    session = %self.session_id,
                    seq,
                    max_retransmits = self.config.max_retransmits,
                    "Giving up on unacknowledged chunk"
                );
                Err(self.fail(abort_reason::ACK_TIMEOUT).await)
            }
        }
    }

    /// Abort locally with `reason`, notifying the peer best-effort
    async fn fail(&mut self, reason: &str) -> DeliveryError {
        self.release(SenderState::Aborted {
            reason: reason.to_string(),
            initiator: AbortInitiator::Local,
        });
        self.notify_abort(reason).await;
        DeliveryError::StreamAborted {
            session_id: self.session_id.clone(),
            reason: reason.to_string(),
            initiator: AbortInitiator::Local,
        }
    }

    /// The sink failed; the session cannot continue
    async fn fail_transport(&mut self, err: DeliveryError) -> DeliveryError {
        tracing::warn!(session = %self.session_id, error = %err, "Stream transmission failed");
        self.release(SenderState::Aborted {
            reason: err.to_string(),
            initiator: AbortInitiator::Local,
        });
        self.notify_abort(&err.to_string()).await;
        err
    }

    /// The engine dropped this session's signal channel
    fn lost(&mut self) -> DeliveryError {
        self.release(SenderState::Aborted {
            reason: "engine shut down".to_string(),
            initiator: AbortInitiator::Local,
        });
        DeliveryError::Shutdown
    }

    async fn notify_abort(&self, reason: &str) {
        let abort = Envelope::StreamAbort {
            session_id: self.session_id.clone(),
            reason: reason.to_string(),
        };
        if let Err(err) = self.sink.send_envelope(abort).await {
            tracing::debug!(session = %self.session_id, error = %err, "Could not notify peer of abort");
        }
    }

    fn release(&mut self, state: SenderState) {
        self.state = state;
        self.registry.remove(&self.session_id);
    }
}

impl Drop for StreamSender {
    fn drop(&mut self) {
        if self.state != SenderState::Open {
            return;
        }
        self.registry.remove(&self.session_id);

        let abort = Envelope::StreamAbort {
            session_id: self.session_id.clone(),
            reason: abort_reason::CANCELLED.to_string(),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sink = Arc::clone(&self.sink);
                handle.spawn(async move {
                    let _ = sink.send_envelope(abort).await;
                });
            }
            Err(_) => {
                tracing::debug!(session = %self.session_id, "Stream dropped outside a runtime; peer not notified");
            }
        }
    }
}

impl std::fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender")
            .field("session_id", &self.session_id)
            .field("bytes_written", &self.bytes_written)
            .field("next_seq", &self.next_seq)
            .field("in_flight", &self.window.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
