//! Courier - The Delivery Context
//!
//! Owns every component of the delivery core and the background tasks that
//! drive them. External collaborators only ever talk to a [`Courier`].
//!
//! ```text
//!  send / post ──► PriorityMessageQueue ──► dispatcher (max_in_flight)
//!                                               │
//!                           ChannelRouter ◄─────┤ select channel
//!                                               ▼
//!                 RequestMultiplexer ◄── FailoverManager ──► Transport
//!                         ▲                                     │
//!                         └──── response dispatch (per channel) ◄┘
//!                                     │
//!                  StreamEngine ◄─────┴─────► incoming()
//! ```
//!
//! # Background tasks
//!
//! - one dispatcher draining the queue in strict priority order
//! - one response-dispatch task per registered channel
//! - one sweep task expiring request deadlines and idle inbound streams, and
//!   flushing due batches

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::clock::SharedClock;
use crate::config::CourierConfig;
use crate::error::{DeliveryError, Result};
use crate::failover::{CircuitBreakerSnapshot, FailoverManager};
use crate::messages::{Envelope, Message, Priority, RequestId, Response, SessionId};
use crate::monitor::{
    AlertEvent, ChannelMetric, PerformanceComparison, PerformanceMonitor, SlaStatus,
};
use crate::multiplexer::RequestMultiplexer;
use crate::queue::PriorityMessageQueue;
use crate::routing::ChannelRouter;
use crate::streaming::{
    abort_reason, CompletedStream, EnvelopeSink, StreamConfig, StreamEngine, StreamMetadata,
    StreamSender,
};
use crate::transport::{connect_channel, ChannelDescriptor, ChannelId, Transport};

/// Peer-initiated traffic buffered before `incoming` consumers fall behind
const INCOMING_CAPACITY: usize = 1024;

/// Something the peer sent that nobody asked for
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    /// A request; answer it with [`Courier::respond`]
    Request {
        /// Channel to answer on
        channel_id: ChannelId,
        /// Id to answer with
        request_id: RequestId,
        /// The request
        message: Message,
    },
    /// A fire-and-forget message (batches arrive unpacked, in order)
    Message {
        /// Channel it arrived on
        channel_id: ChannelId,
        /// The message
        message: Message,
    },
    /// A fully received stream
    Stream(CompletedStream),
}

enum Outbound {
    Request {
        message: Message,
        reply: oneshot::Sender<Result<Response>>,
    },
    Post {
        message: Message,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl Outbound {
    fn fail(self, err: DeliveryError) {
        match self {
            Self::Request { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Post { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

struct Shared {
    config: CourierConfig,
    clock: SharedClock,
    failover: FailoverManager,
    router: ChannelRouter,
    multiplexer: RequestMultiplexer,
    monitor: Arc<PerformanceMonitor>,
    streams: StreamEngine,
    queue: PriorityMessageQueue<Outbound>,
    incoming_tx: mpsc::Sender<Incoming>,
    closed: AtomicBool,
}

/// Routes stream envelopes through the failover path of one channel
struct ChannelSink {
    shared: Arc<Shared>,
    channel_id: ChannelId,
}

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.shared.failover.transmit(&self.channel_id, envelope).await
    }
}

/// The delivery core
///
/// Must be created inside a tokio runtime; construction spawns the
/// dispatcher and sweep tasks.
pub struct Courier {
    shared: Arc<Shared>,
    incoming_rx: Mutex<Option<mpsc::Receiver<Incoming>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Courier {
    /// Build every component from `config` and start the background tasks
    pub fn new(config: CourierConfig, clock: SharedClock) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(
            config.monitor.clone(),
            config.sla.clone(),
            config.alerts.clone(),
            Arc::clone(&clock),
        ));
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        let shared = Arc::new(Shared {
            failover: FailoverManager::new(
                config.failover.clone(),
                Arc::clone(&clock),
                Arc::clone(&monitor),
            ),
            router: ChannelRouter::new(config.routing.clone(), Arc::clone(&clock)),
            multiplexer: RequestMultiplexer::new(config.multiplexer.clone(), Arc::clone(&clock)),
            streams: StreamEngine::new(config.stream.clone(), Arc::clone(&clock)),
            queue: PriorityMessageQueue::new(&config.queue),
            monitor,
            incoming_tx,
            closed: AtomicBool::new(false),
            clock,
            config,
        });

        let tasks = vec![
            tokio::spawn(dispatch_loop(Arc::clone(&shared))),
            tokio::spawn(sweep_loop(Arc::clone(&shared))),
        ];

        tracing::info!(
            max_in_flight = shared.config.queue.max_in_flight,
            request_timeout_ms = shared.config.multiplexer.request_timeout.as_millis() as u64,
            "Courier started"
        );

        Self {
            shared,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            tasks: Mutex::new(tasks),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &CourierConfig {
        &self.shared.config
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Connect the channel `descriptor` describes and register it
    ///
    /// # Errors
    ///
    /// - `Transient` / `Permanent` if the connection cannot be established
    /// - `Permanent` if the id is already registered
    pub async fn register_channel(&self, descriptor: &ChannelDescriptor) -> Result<()> {
        let channel = connect_channel(descriptor, &self.shared.config.failover.performance)
            .await
            .map_err(|e| DeliveryError::from_transport(&descriptor.id, e))?;
        self.register_transport(Arc::new(channel), descriptor.destinations.clone())
    }

    /// Register an already connected transport
    ///
    /// `destinations` lists what the channel can reach; empty means anything.
    ///
    /// # Errors
    ///
    /// `Permanent` if the id is already registered or the transport's inbound
    /// queue was taken by someone else.
    pub fn register_transport(
        &self,
        transport: Arc<dyn Transport>,
        destinations: Vec<String>,
    ) -> Result<()> {
        self.ensure_open()?;
        let channel_id = transport.id().clone();
        let inbound = transport.take_inbound().ok_or_else(|| {
            DeliveryError::Permanent(format!("inbound queue of {channel_id} is already taken"))
        })?;

        self.shared.failover.register(transport, destinations)?;
        let handle = tokio::spawn(inbound_loop(
            Arc::clone(&self.shared),
            channel_id,
            inbound,
        ));
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Flush, close and forget a channel
    ///
    /// Requests waiting on it fail with `Transient`.
    pub async fn deregister_channel(&self, channel_id: &ChannelId) -> Result<()> {
        self.shared.failover.deregister(channel_id).await?;
        self.shared.router.remove_channel(channel_id);
        self.shared
            .multiplexer
            .fail_channel(channel_id, "channel deregistered");
        self.shared.streams.fail_channel(channel_id);
        self.shared.monitor.remove_channel(channel_id);
        Ok(())
    }

    /// Registered channel ids, sorted
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.shared.failover.channel_ids()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a request and wait for its response
    ///
    /// Dropping the returned future cancels the request: it is skipped if
    /// still queued, and its pending entry is released if already sent.
    ///
    /// # Errors
    ///
    /// - `QueueFull` if the priority tier is at capacity
    /// - `NoChannel` if no registered channel serves `destination`
    /// - `CircuitOpen` if every candidate channel is rejecting
    /// - `TimedOut` if no response arrives within the request timeout
    /// - `RetryExhausted` / `Permanent` from the send path, after one
    ///   failover attempt where allowed
    pub async fn send(
        &self,
        destination: &str,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Result<Response> {
        self.ensure_open()?;
        let message = Message::new(destination, payload, priority, self.shared.clock.now());
        let (reply, rx) = oneshot::channel();
        self.shared
            .queue
            .enqueue(Outbound::Request { message, reply }, priority)?;
        rx.await.unwrap_or(Err(DeliveryError::Shutdown))
    }

    /// Send a fire-and-forget message
    ///
    /// Resolves once the message is on the wire, or buffered for batching
    /// when it is low priority.
    pub async fn post(&self, destination: &str, payload: Vec<u8>, priority: Priority) -> Result<()> {
        self.ensure_open()?;
        let message = Message::new(destination, payload, priority, self.shared.clock.now());
        let (reply, rx) = oneshot::channel();
        self.shared
            .queue
            .enqueue(Outbound::Post { message, reply }, priority)?;
        rx.await.unwrap_or(Err(DeliveryError::Shutdown))
    }

    /// Start a stream to `destination` on the best available channel
    ///
    /// The session stays on that channel; `config` overrides the stream
    /// defaults for this session.
    pub async fn open_stream(
        &self,
        destination: &str,
        metadata: StreamMetadata,
        config: Option<StreamConfig>,
    ) -> Result<StreamSender> {
        self.ensure_open()?;
        let channel_id = self.shared.select(destination)?;
        let sink = Arc::new(ChannelSink {
            shared: Arc::clone(&self.shared),
            channel_id,
        });
        self.shared.streams.open(sink, metadata, config).await
    }

    /// Answer a request received through [`incoming`](Self::incoming)
    pub async fn respond(
        &self,
        channel_id: &ChannelId,
        request_id: RequestId,
        payload: Vec<u8>,
    ) -> Result<()> {
        let envelope = Envelope::Response {
            request_id,
            payload,
            error: None,
        };
        self.shared.failover.transmit(channel_id, envelope).await
    }

    /// Report failure for a request received through [`incoming`](Self::incoming)
    pub async fn respond_error(
        &self,
        channel_id: &ChannelId,
        request_id: RequestId,
        reason: impl Into<String>,
    ) -> Result<()> {
        let envelope = Envelope::Response {
            request_id,
            payload: Vec::new(),
            error: Some(reason.into()),
        };
        self.shared.failover.transmit(channel_id, envelope).await
    }

    /// Peer-initiated requests, messages and completed streams
    ///
    /// Can be taken once; later calls return `None`.
    pub fn incoming(&self) -> Option<ReceiverStream<Incoming>> {
        self.incoming_rx.lock().take().map(ReceiverStream::new)
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Per-channel aggregates
    pub fn get_metrics(&self) -> Vec<ChannelMetric> {
        self.shared.monitor.get_metrics()
    }

    /// SLA compliance per channel
    pub fn get_sla_status(&self) -> std::collections::BTreeMap<ChannelId, SlaStatus> {
        self.shared.monitor.get_all_sla_status()
    }

    /// Best channel per dimension
    pub fn get_performance_comparison(&self) -> PerformanceComparison {
        self.shared.monitor.get_performance_comparison()
    }

    /// Breaker state per channel
    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.shared.failover.snapshots()
    }

    /// Subscribe to alert transitions
    pub fn alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.shared.monitor.subscribe()
    }

    /// Most recent alert transitions, oldest first
    pub fn recent_alerts(&self) -> Vec<AlertEvent> {
        self.shared.monitor.recent_alerts()
    }

    /// Prometheus text exposition of channel metrics and breaker states
    pub fn prometheus(&self) -> String {
        self.shared
            .monitor
            .to_prometheus(&self.shared.failover.snapshots())
    }

    /// Requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.shared.multiplexer.pending_count()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Fail queued and pending work, flush batches, and close every channel
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Courier shutting down");

        self.shared.queue.close();
        for (item, _) in self.shared.queue.drain() {
            item.fail(DeliveryError::Shutdown);
        }

        let flushed = self.shared.failover.flush_all().await;
        let failed = self.shared.multiplexer.fail_all();
        self.shared.streams.shutdown();
        self.shared.failover.close_all().await;

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::info!(flushed, failed_requests = failed, "Courier stopped");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(DeliveryError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        self.shared.queue.close();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("channels", &self.shared.failover.channel_ids())
            .field("queued", &self.shared.queue.len())
            .field("pending", &self.shared.multiplexer.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Delivery path
// ============================================================================

impl Shared {
    fn candidates(&self, destination: &str) -> Result<Vec<ChannelId>> {
        let candidates = self.failover.channels_for(destination);
        if candidates.is_empty() {
            return Err(DeliveryError::NoChannel {
                destination: destination.to_string(),
            });
        }
        Ok(candidates)
    }

    /// Preferred channel for `destination`
    fn select(&self, destination: &str) -> Result<ChannelId> {
        let candidates = self.candidates(destination)?;
        self.router
            .select_channel(destination, &candidates, |id| self.failover.is_rejecting(id))
            .map(|entry| entry.channel_id)
            .ok_or_else(|| self.failover.rejection(&candidates[0]))
    }

    fn alternate(&self, destination: &str, failed: &ChannelId, err: &DeliveryError) -> Option<ChannelId> {
        if !err.allows_failover() {
            return None;
        }
        let candidates = self.failover.channels_for(destination);
        let alternate = self.router.select_alternate(destination, &candidates, failed, |id| {
            self.failover.is_rejecting(id)
        })?;
        tracing::info!(
            destination,
            from = %failed,
            to = %alternate,
            error = %err,
            "Failing over to alternate channel"
        );
        Some(alternate)
    }

    async fn deliver_request(&self, message: Message) -> Result<Response> {
        let channel_id = self.select(&message.destination)?;
        match self.request_on(&channel_id, &message).await {
            Err(err) => match self.alternate(&message.destination, &channel_id, &err) {
                Some(alternate) => self.request_on(&alternate, &message).await,
                None => Err(err),
            },
            ok => ok,
        }
    }

    async fn request_on(&self, channel_id: &ChannelId, message: &Message) -> Result<Response> {
        let _load = self.router.track(channel_id);
        let started = self.clock.now();
        let (request_id, mut pending) = self.multiplexer.register(channel_id);

        let envelope = Envelope::Request {
            request_id,
            message: message.clone(),
        };
        // The deadline sweep bounds the send as well as the wait
        let settled = tokio::select! {
            biased;
            resolved = &mut pending => Some(resolved),
            sent = self.failover.transmit(channel_id, envelope) => sent.err().map(Err),
        };
        let result = match settled {
            Some(result) => result,
            None => pending.await,
        };

        // A peer-reported failure still proves the channel works
        let reachable = matches!(result, Ok(_) | Err(DeliveryError::Remote(_)));
        let latency = self.clock.now().saturating_sub(started);
        self.router
            .record_outcome(&message.destination, channel_id, latency, reachable);
        result
    }

    async fn deliver_post(&self, message: Message) -> Result<()> {
        let channel_id = self.select(&message.destination)?;
        match self.post_on(&channel_id, message.clone()).await {
            Err(err) => match self.alternate(&message.destination, &channel_id, &err) {
                Some(alternate) => self.post_on(&alternate, message).await,
                None => Err(err),
            },
            ok => ok,
        }
    }

    async fn post_on(&self, channel_id: &ChannelId, message: Message) -> Result<()> {
        let _load = self.router.track(channel_id);
        let started = self.clock.now();
        let destination = message.destination.clone();

        let result = self.failover.send_message(channel_id, message).await;
        let latency = self.clock.now().saturating_sub(started);
        self.router
            .record_outcome(&destination, channel_id, latency, result.is_ok());
        result
    }

    fn deliver_incoming(&self, item: Incoming) {
        match self.incoming_tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                tracing::warn!(?item, "Incoming queue full, dropping peer traffic");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Incoming consumer gone, dropping peer traffic");
            }
        }
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Drain the queue in priority order, at most `max_in_flight` sends at once
async fn dispatch_loop(shared: Arc<Shared>) {
    let permits = Arc::new(Semaphore::new(shared.config.queue.max_in_flight.max(1)));

    loop {
        // Take a permit first so items wait in the queue, where priority applies
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some((item, priority)) = shared.queue.dequeue_wait().await else {
            break;
        };

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            match item {
                Outbound::Request { message, mut reply } => {
                    tracing::trace!(destination = %message.destination, %priority, "Dispatching request");
                    // Caller gone: dropping the delivery releases its pending entry
                    let outcome = tokio::select! {
                        biased;
                        () = reply.closed() => None,
                        result = shared.deliver_request(message) => Some(result),
                    };
                    match outcome {
                        Some(result) => {
                            let _ = reply.send(result);
                        }
                        None => tracing::debug!(%priority, "Request cancelled by caller"),
                    }
                }
                Outbound::Post { message, reply } => {
                    let _ = reply.send(shared.deliver_post(message).await);
                }
            }
        });
    }

    tracing::debug!("Dispatcher stopped");
}

/// Expire request deadlines and quiet inbound streams, and flush due batches
async fn sweep_loop(shared: Arc<Shared>) {
    let interval = shared
        .config
        .multiplexer
        .sweep_interval
        .min(shared.config.failover.batch.max_batch_delay)
        .max(Duration::from_millis(1));

    while !shared.closed.load(Ordering::Acquire) {
        shared.clock.sleep(interval).await;

        let expired = shared.multiplexer.sweep_expired();
        if expired > 0 {
            tracing::debug!(expired, "Expired pending requests");
        }
        for (channel_id, session_id) in shared.streams.expire_idle() {
            tokio::spawn(notify_stream_expired(Arc::clone(&shared), channel_id, session_id));
        }
        shared.failover.flush_expired().await;
    }
}

async fn notify_stream_expired(shared: Arc<Shared>, channel_id: ChannelId, session_id: SessionId) {
    let abort = Envelope::StreamAbort {
        session_id,
        reason: abort_reason::IDLE_TIMEOUT.to_string(),
    };
    if let Err(err) = shared.failover.transmit(&channel_id, abort).await {
        tracing::debug!(channel = %channel_id, error = %err, "Could not notify peer of expired stream");
    }
}

/// Response dispatch for one channel
async fn inbound_loop(
    shared: Arc<Shared>,
    channel_id: ChannelId,
    mut inbound: mpsc::Receiver<Envelope>,
) {
    let reply = ChannelSink {
        shared: Arc::clone(&shared),
        channel_id: channel_id.clone(),
    };

    while let Some(envelope) = inbound.recv().await {
        shared
            .monitor
            .record_received(&channel_id, envelope.payload_len());

        match envelope {
            Envelope::Response {
                request_id,
                payload,
                error,
            } => {
                shared
                    .multiplexer
                    .resolve(&channel_id, request_id, payload, error);
            }
            Envelope::Request {
                request_id,
                message,
            } => shared.deliver_incoming(Incoming::Request {
                channel_id: channel_id.clone(),
                request_id,
                message,
            }),
            Envelope::Message { message } => shared.deliver_incoming(Incoming::Message {
                channel_id: channel_id.clone(),
                message,
            }),
            Envelope::Batch { messages } => {
                for message in messages {
                    shared.deliver_incoming(Incoming::Message {
                        channel_id: channel_id.clone(),
                        message,
                    });
                }
            }
            stream => match shared.streams.handle_inbound(&channel_id, stream, &reply).await {
                Ok(Some(done)) => shared.deliver_incoming(Incoming::Stream(done)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(channel = %channel_id, error = %err, "Stream envelope not handled");
                }
            },
        }
    }

    if !shared.closed.load(Ordering::Acquire) {
        tracing::warn!(channel = %channel_id, "Channel inbound closed");
    }
    let failed = shared.multiplexer.fail_channel(&channel_id, "channel closed");
    let dropped = shared.streams.fail_channel(&channel_id);
    if failed + dropped > 0 {
        tracing::info!(
            channel = %channel_id,
            failed_requests = failed,
            dropped_streams = dropped,
            "Released work bound to closed channel"
        );
    }
}
