//! Session bookkeeping for both directions

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::sender::{SignalRegistry, StreamSignal};
use super::{abort_reason, EnvelopeSink, StreamConfig, StreamMetadata, StreamReceiver, StreamSender};
use crate::clock::SharedClock;
use crate::error::{DeliveryError, Result};
use crate::messages::{Envelope, SessionId};
use crate::transport::ChannelId;

/// Completed sessions remembered so a retransmitted end marker is re-acked
const COMPLETED_MEMORY: usize = 64;

type InboundKey = (ChannelId, SessionId);

/// A fully received inbound stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedStream {
    pub session_id: SessionId,
    pub channel_id: ChannelId,
    pub metadata: StreamMetadata,
    pub data: Vec<u8>,
}

enum EndOutcome {
    Complete(CompletedStream, u64),
    Incomplete,
    AlreadyComplete(u64),
    Rejected(&'static str),
}

/// Opens outbound sessions and drives inbound ones
///
/// Outbound sessions are owned by their [`StreamSender`]; the engine only
/// routes acknowledgments and aborts to them. Inbound sessions live here
/// until completed or aborted.
pub struct StreamEngine {
    config: StreamConfig,
    clock: SharedClock,
    outbound: Arc<SignalRegistry>,
    inbound: Mutex<HashMap<InboundKey, StreamReceiver>>,
    completed: Mutex<VecDeque<(InboundKey, u64)>>,
}

impl StreamEngine {
    pub fn new(config: StreamConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            outbound: Arc::new(SignalRegistry::new()),
            inbound: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::with_capacity(COMPLETED_MEMORY)),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start an outbound session over `sink`
    ///
    /// `config` overrides the engine defaults for this session only.
    pub async fn open(
        &self,
        sink: Arc<dyn EnvelopeSink>,
        metadata: StreamMetadata,
        config: Option<StreamConfig>,
    ) -> Result<StreamSender> {
        let config = config.unwrap_or_else(|| self.config.clone());
        if config.max_chunk_size == 0 || config.window_size == 0 {
            return Err(DeliveryError::Permanent(
                "stream chunk size and window size must be positive".to_string(),
            ));
        }

        let session_id = SessionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.insert(session_id.clone(), tx);

        let start = Envelope::StreamStart {
            session_id: session_id.clone(),
            metadata: metadata.clone(),
            chunk_size: config.max_chunk_size,
        };
        if let Err(err) = sink.send_envelope(start).await {
            self.outbound.remove(&session_id);
            return Err(err);
        }

        tracing::debug!(
            session = %session_id,
            total_size = metadata.total_size,
            content_type = %metadata.content_type,
            "Stream opened"
        );

        Ok(StreamSender::new(
            session_id,
            metadata,
            config,
            sink,
            Arc::clone(&self.clock),
            rx,
            Arc::clone(&self.outbound),
        ))
    }

    /// Process a stream envelope received on `channel_id`
    ///
    /// Acknowledgments and aborts for inbound sessions go out through
    /// `reply`. Returns the payload once an inbound session completes.
    pub async fn handle_inbound(
        &self,
        channel_id: &ChannelId,
        envelope: Envelope,
        reply: &dyn EnvelopeSink,
    ) -> Result<Option<CompletedStream>> {
        match envelope {
            Envelope::StreamStart {
                session_id,
                metadata,
                chunk_size,
            } => {
                let key = (channel_id.clone(), session_id);
                let accepted = {
                    let mut inbound = self.inbound.lock();
                    if inbound.len() >= self.config.max_concurrent_streams {
                        Err(abort_reason::TOO_MANY_STREAMS)
                    } else {
                        let now = self.clock.now();
                        StreamReceiver::new(key.1.clone(), metadata, chunk_size, &self.config, now)
                            .map(|receiver| {
                                inbound.insert(key.clone(), receiver);
                            })
                    }
                };
                if let Err(reason) = accepted {
                    self.reject(reply, key.1, reason).await?;
                }
                Ok(None)
            }

            Envelope::StreamChunk {
                session_id,
                seq,
                compressed,
                data,
            } => {
                let key = (channel_id.clone(), session_id);
                let accepted = {
                    let mut inbound = self.inbound.lock();
                    match inbound.get_mut(&key) {
                        None => Err(abort_reason::UNKNOWN_SESSION),
                        Some(receiver) => {
                            receiver.touch(self.clock.now());
                            let outcome = receiver.accept_chunk(seq, compressed, data);
                            if outcome.is_err() {
                                inbound.remove(&key);
                            }
                            outcome
                        }
                    }
                };

                match accepted {
                    // Duplicates are acked again; the first ack may have been lost
                    Ok(_) => {
                        reply
                            .send_envelope(Envelope::StreamAck {
                                session_id: key.1,
                                seq,
                            })
                            .await?;
                    }
                    Err(reason) => self.reject(reply, key.1, reason).await?,
                }
                Ok(None)
            }

            Envelope::StreamEnd {
                session_id,
                total_chunks,
            } => {
                let key = (channel_id.clone(), session_id);
                match self.finish(&key, total_chunks) {
                    EndOutcome::Complete(done, seq) => {
                        reply
                            .send_envelope(Envelope::StreamAck {
                                session_id: key.1,
                                seq,
                            })
                            .await?;
                        tracing::debug!(
                            session = %done.session_id,
                            channel = %done.channel_id,
                            bytes = done.data.len(),
                            "Inbound stream completed"
                        );
                        Ok(Some(done))
                    }
                    EndOutcome::AlreadyComplete(seq) => {
                        reply
                            .send_envelope(Envelope::StreamAck {
                                session_id: key.1,
                                seq,
                            })
                            .await?;
                        Ok(None)
                    }
                    EndOutcome::Incomplete => Ok(None),
                    EndOutcome::Rejected(reason) => {
                        self.reject(reply, key.1, reason).await?;
                        Ok(None)
                    }
                }
            }

            Envelope::StreamAck { session_id, seq } => {
                match self.outbound.get(&session_id) {
                    Some(tx) => {
                        let _ = tx.send(StreamSignal::Ack(seq));
                    }
                    None => {
                        tracing::trace!(session = %session_id, seq, "Ack for finished session");
                    }
                }
                Ok(None)
            }

            Envelope::StreamAbort { session_id, reason } => {
                if let Some((_, tx)) = self.outbound.remove(&session_id) {
                    let _ = tx.send(StreamSignal::Abort(reason.clone()));
                }
                let key = (channel_id.clone(), session_id);
                if self.inbound.lock().remove(&key).is_some() {
                    tracing::info!(session = %key.1, %reason, "Inbound stream aborted by peer");
                }
                Ok(None)
            }

            other => Err(DeliveryError::Permanent(format!(
                "{} is not a stream envelope",
                other.kind()
            ))),
        }
    }

    fn finish(&self, key: &InboundKey, total_chunks: u64) -> EndOutcome {
        let mut inbound = self.inbound.lock();
        let Some(receiver) = inbound.get_mut(key) else {
            let completed = self.completed.lock();
            return completed
                .iter()
                .find(|(k, _)| k == key)
                .map_or(EndOutcome::Rejected(abort_reason::UNKNOWN_SESSION), |(_, seq)| {
                    EndOutcome::AlreadyComplete(*seq)
                });
        };
        receiver.touch(self.clock.now());

        match receiver.finish(total_chunks) {
            Ok(None) => EndOutcome::Incomplete,
            Err(reason) => {
                inbound.remove(key);
                EndOutcome::Rejected(reason)
            }
            Ok(Some(data)) => {
                let metadata = receiver.metadata().clone();
                inbound.remove(key);

                let mut completed = self.completed.lock();
                if completed.len() == COMPLETED_MEMORY {
                    completed.pop_front();
                }
                completed.push_back((key.clone(), total_chunks));

                EndOutcome::Complete(
                    CompletedStream {
                        session_id: key.1.clone(),
                        channel_id: key.0.clone(),
                        metadata,
                        data,
                    },
                    total_chunks,
                )
            }
        }
    }

    async fn reject(
        &self,
        reply: &dyn EnvelopeSink,
        session_id: SessionId,
        reason: &'static str,
    ) -> Result<()> {
        tracing::warn!(session = %session_id, reason, "Rejecting inbound stream");
        reply
            .send_envelope(Envelope::StreamAbort {
                session_id,
                reason: reason.to_string(),
            })
            .await
    }

    /// Drop inbound sessions arriving on a channel that went down
    pub fn fail_channel(&self, channel_id: &ChannelId) -> usize {
        let mut inbound = self.inbound.lock();
        let before = inbound.len();
        inbound.retain(|(channel, _), _| channel != channel_id);
        before - inbound.len()
    }

    /// Drop inbound sessions whose sender has gone quiet
    ///
    /// A session expires after `inbound_idle_timeout` without a start, chunk
    /// or end marker. Returns the expired sessions so the caller can tell the
    /// peer.
    pub fn expire_idle(&self) -> Vec<(ChannelId, SessionId)> {
        let now = self.clock.now();
        let limit = self.config.inbound_idle_timeout();

        let mut inbound = self.inbound.lock();
        let expired: Vec<InboundKey> = inbound
            .iter()
            .filter(|(_, receiver)| receiver.idle_for(now) >= limit)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(receiver) = inbound.remove(key) {
                tracing::info!(
                    session = %key.1,
                    channel = %key.0,
                    chunks = receiver.chunks_received(),
                    "Inbound stream expired after sender went quiet"
                );
            }
        }
        expired
    }

    /// Outbound sessions still open
    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// Inbound sessions still being received
    pub fn inbound_count(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Release every session; open senders fail with `Shutdown`
    pub fn shutdown(&self) {
        self.outbound.clear();
        self.inbound.lock().clear();
    }
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::error::AbortInitiator;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    struct ChannelSink(mpsc::UnboundedSender<Envelope>);

    #[async_trait]
    impl EnvelopeSink for ChannelSink {
        async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
            self.0.send(envelope).map_err(|_| DeliveryError::Shutdown)
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Envelope>>);

    impl RecordingSink {
        fn sent(&self) -> Vec<Envelope> {
            self.0.lock().clone()
        }

        fn chunk_count(&self) -> usize {
            self.sent()
                .iter()
                .filter(|e| matches!(e, Envelope::StreamChunk { .. }))
                .count()
        }

        fn aborts(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|e| match e {
                    Envelope::StreamAbort { reason, .. } => Some(reason),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl EnvelopeSink for RecordingSink {
        async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
            self.0.lock().push(envelope);
            Ok(())
        }
    }

    fn config(chunk: usize, window: usize) -> StreamConfig {
        StreamConfig {
            max_chunk_size: chunk,
            window_size: window,
            compression_threshold: 512,
            ack_timeout: Duration::from_secs(5),
            ..StreamConfig::default()
        }
    }

    fn engine(config: StreamConfig) -> Arc<StreamEngine> {
        Arc::new(StreamEngine::new(config, SystemClock::shared()))
    }

    /// Connect two engines through in-memory queues; chunks whose sequence
    /// number is in `drop_first` are lost on their first transmission.
    fn wire(
        origin: &Arc<StreamEngine>,
        peer: &Arc<StreamEngine>,
        drop_first: HashSet<u64>,
    ) -> (Arc<dyn EnvelopeSink>, mpsc::UnboundedReceiver<CompletedStream>) {
        let (to_peer_tx, mut to_peer_rx) = mpsc::unbounded_channel::<Envelope>();
        let (to_origin_tx, mut to_origin_rx) = mpsc::unbounded_channel::<Envelope>();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let channel = ChannelId::new("ipc-test");

        {
            let peer = Arc::clone(peer);
            let channel = channel.clone();
            let reply = ChannelSink(to_origin_tx);
            tokio::spawn(async move {
                let mut drop_first = drop_first;
                while let Some(envelope) = to_peer_rx.recv().await {
                    if let Envelope::StreamChunk { seq, .. } = &envelope {
                        if drop_first.remove(seq) {
                            continue;
                        }
                    }
                    if let Ok(Some(done)) = peer.handle_inbound(&channel, envelope, &reply).await {
                        let _ = done_tx.send(done);
                    }
                }
            });
        }
        {
            let origin = Arc::clone(origin);
            let unused = RecordingSink::default();
            tokio::spawn(async move {
                while let Some(envelope) = to_origin_rx.recv().await {
                    let _ = origin.handle_inbound(&channel, envelope, &unused).await;
                }
            });
        }

        (Arc::new(ChannelSink(to_peer_tx)), done_rx)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_loopback_transfer() {
        let origin = engine(config(1024, 4));
        let peer = engine(config(1024, 4));
        let (sink, mut done) = wire(&origin, &peer, HashSet::new());

        let data = payload(10_000);
        let metadata = StreamMetadata::new(data.len() as u64, "application/octet-stream")
            .with_property("name", "model.bin");
        let mut sender = origin.open(sink, metadata.clone(), None).await.unwrap();

        for piece in data.chunks(3000) {
            sender.write(piece).await.unwrap();
        }
        let summary = sender.close().await.unwrap();

        assert_eq!(summary.total_bytes, 10_000);
        assert_eq!(summary.chunks, 10);
        assert_eq!(summary.retransmissions, 0);

        let received = done.recv().await.unwrap();
        assert_eq!(received.data, data);
        assert_eq!(received.metadata, metadata);
        assert_eq!(origin.outbound_count(), 0);
        assert_eq!(peer.inbound_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bounds_unacked_chunks() {
        let origin = engine(config(4, 3));
        let sink = Arc::new(RecordingSink::default());

        let mut sender = origin
            .open(sink.clone(), StreamMetadata::new(40, "text/plain"), None)
            .await
            .unwrap();
        let writer = tokio::spawn(async move { sender.write(&[7u8; 40]).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.chunk_count(), 3);
        assert!(!writer.is_finished());
        writer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_chunk_retransmits_tail_only() {
        let origin = engine(config(4, 4));
        let peer = engine(config(4, 4));
        let (sink, mut done) = wire(&origin, &peer, HashSet::from([1]));

        let data = payload(24);
        let mut sender = origin
            .open(sink, StreamMetadata::new(24, "text/plain"), None)
            .await
            .unwrap();
        sender.write(&data).await.unwrap();
        let summary = sender.close().await.unwrap();

        // Chunk 1 and the end marker were still unacknowledged at the timeout
        assert_eq!(summary.retransmissions, 2);
        assert_eq!(done.recv().await.unwrap().data, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_acks_abort_after_retransmit_limit() {
        let origin = engine(StreamConfig {
            max_retransmits: 2,
            ack_timeout: Duration::from_millis(100),
            ..config(4, 2)
        });
        let sink = Arc::new(RecordingSink::default());

        let mut sender = origin
            .open(sink.clone(), StreamMetadata::new(4, "text/plain"), None)
            .await
            .unwrap();
        sender.write(b"abcd").await.unwrap();

        match sender.close().await {
            Err(DeliveryError::StreamAborted {
                reason, initiator, ..
            }) => {
                assert_eq!(reason, abort_reason::ACK_TIMEOUT);
                assert_eq!(initiator, AbortInitiator::Local);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        // original + two retransmissions
        assert_eq!(sink.chunk_count(), 3);
        assert_eq!(sink.aborts(), vec![abort_reason::ACK_TIMEOUT.to_string()]);
        assert_eq!(origin.outbound_count(), 0);
    }

    #[tokio::test]
    async fn test_writing_past_announced_size_aborts() {
        let origin = engine(config(4, 2));
        let sink = Arc::new(RecordingSink::default());

        let mut sender = origin
            .open(sink.clone(), StreamMetadata::new(3, "text/plain"), None)
            .await
            .unwrap();
        let err = sender.write(b"toolong").await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::StreamAborted { ref reason, .. } if reason == abort_reason::SIZE_MISMATCH
        ));
        assert_eq!(sink.aborts(), vec![abort_reason::SIZE_MISMATCH.to_string()]);

        // Session state is gone; further writes report the same abort
        assert!(matches!(
            sender.write(b"x").await,
            Err(DeliveryError::StreamAborted { .. })
        ));
        assert_eq!(origin.outbound_count(), 0);
    }

    #[tokio::test]
    async fn test_closing_short_aborts() {
        let origin = engine(config(4, 2));
        let sink = Arc::new(RecordingSink::default());

        let mut sender = origin
            .open(sink.clone(), StreamMetadata::new(8, "text/plain"), None)
            .await
            .unwrap();
        sender.write(b"abc").await.unwrap();
        assert!(matches!(
            sender.close().await,
            Err(DeliveryError::StreamAborted { .. })
        ));
        assert_eq!(sink.aborts(), vec![abort_reason::SIZE_MISMATCH.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_abort_unblocks_writer() {
        let origin = engine(config(4, 1));
        let sink = Arc::new(RecordingSink::default());

        let mut sender = origin
            .open(sink.clone(), StreamMetadata::new(8, "text/plain"), None)
            .await
            .unwrap();
        let session_id = sender.session_id().clone();
        let writer = tokio::spawn(async move { sender.write(&[1u8; 8]).await });

        tokio::time::sleep(Duration::from_millis(1)).await;
        origin
            .handle_inbound(
                &ChannelId::new("tcp-1"),
                Envelope::StreamAbort {
                    session_id,
                    reason: "disk full".into(),
                },
                &RecordingSink::default(),
            )
            .await
            .unwrap();

        match writer.await.unwrap() {
            Err(DeliveryError::StreamAborted {
                reason, initiator, ..
            }) => {
                assert_eq!(reason, "disk full");
                assert_eq!(initiator, AbortInitiator::Peer);
            }
            other => panic!("expected peer abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropping_sender_notifies_peer() {
        let origin = engine(config(4, 2));
        let sink = Arc::new(RecordingSink::default());

        let sender = origin
            .open(sink.clone(), StreamMetadata::new(8, "text/plain"), None)
            .await
            .unwrap();
        drop(sender);
        tokio::task::yield_now().await;

        assert_eq!(sink.aborts(), vec![abort_reason::CANCELLED.to_string()]);
        assert_eq!(origin.outbound_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_and_stream_limit() {
        let peer = engine(StreamConfig {
            max_concurrent_streams: 1,
            ..config(4, 2)
        });
        let reply = RecordingSink::default();
        let channel = ChannelId::new("tcp-1");

        peer.handle_inbound(
            &channel,
            Envelope::StreamChunk {
                session_id: SessionId("ghost".into()),
                seq: 0,
                compressed: false,
                data: vec![1],
            },
            &reply,
        )
        .await
        .unwrap();

        for id in ["a", "b"] {
            peer.handle_inbound(
                &channel,
                Envelope::StreamStart {
                    session_id: SessionId(id.into()),
                    metadata: StreamMetadata::new(4, "text/plain"),
                    chunk_size: 4,
                },
                &reply,
            )
            .await
            .unwrap();
        }

        assert_eq!(
            reply.aborts(),
            vec![
                abort_reason::UNKNOWN_SESSION.to_string(),
                abort_reason::TOO_MANY_STREAMS.to_string()
            ]
        );
        assert_eq!(peer.inbound_count(), 1);
        assert_eq!(peer.fail_channel(&channel), 1);
    }

    #[tokio::test]
    async fn test_quiet_inbound_session_expires_and_frees_slot() {
        let clock = ManualClock::shared();
        let peer = StreamEngine::new(
            StreamConfig {
                max_concurrent_streams: 1,
                ..config(4, 2)
            },
            clock.clone(),
        );
        let reply = RecordingSink::default();
        let channel = ChannelId::new("tcp-1");
        let start = |id: &str| Envelope::StreamStart {
            session_id: SessionId(id.into()),
            metadata: StreamMetadata::new(8, "text/plain"),
            chunk_size: 4,
        };

        peer.handle_inbound(&channel, start("quiet"), &reply).await.unwrap();
        clock.advance(Duration::from_secs(10));
        peer.handle_inbound(
            &channel,
            Envelope::StreamChunk {
                session_id: SessionId("quiet".into()),
                seq: 0,
                compressed: false,
                data: vec![1, 2, 3, 4],
            },
            &reply,
        )
        .await
        .unwrap();

        // 5s ack timeout x 6 transmissions, counted from the last chunk
        clock.advance(Duration::from_secs(29));
        assert!(peer.expire_idle().is_empty());
        clock.advance(Duration::from_secs(1));
        assert_eq!(
            peer.expire_idle(),
            vec![(channel.clone(), SessionId("quiet".into()))]
        );
        assert_eq!(peer.inbound_count(), 0);

        peer.handle_inbound(&channel, start("next"), &reply).await.unwrap();
        assert_eq!(peer.inbound_count(), 1);
        assert!(reply.aborts().is_empty());
    }

    #[tokio::test]
    async fn test_non_stream_envelope_rejected() {
        let peer = engine(StreamConfig::default());
        let err = peer
            .handle_inbound(
                &ChannelId::new("tcp-1"),
                Envelope::Batch { messages: vec![] },
                &RecordingSink::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent(_)));
    }
}
