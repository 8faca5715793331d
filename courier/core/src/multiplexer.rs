//! Request Multiplexer
//!
//! Correlates concurrent request/response pairs sharing channels. Every
//! outbound request gets a unique [`RequestId`] and a pending entry with a
//! deadline; the channel's response-dispatch task resolves entries as
//! responses arrive, and a periodic sweep fails expired ones with
//! [`DeliveryError::TimedOut`].
//!
//! ```text
//!  send ──register()──► pending table ◄──resolve()── response dispatch task
//!    │                        ▲
//!    └── await PendingResponse│
//!                             └──sweep_expired()── sweep task
//! ```
//!
//! Dropping a [`PendingResponse`] before it resolves removes its entry, so an
//! abandoned request never lingers in the table.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::clock::SharedClock;
use crate::error::{DeliveryError, Result};
use crate::messages::{RequestId, Response};
use crate::transport::ChannelId;

/// Request deadline tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Time a request may wait for its response
    #[serde(rename = "request_timeout_ms", with = "crate::config::duration_ms")]
    pub request_timeout: Duration,

    /// How often expired requests are swept
    #[serde(rename = "sweep_interval_ms", with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Pending {
    channel_id: ChannelId,
    deadline: Duration,
    tx: oneshot::Sender<Result<Response>>,
}

type PendingTable = DashMap<RequestId, Pending>;

/// Future resolving to the response for one request
///
/// Dropping it cancels the request locally.
#[derive(Debug)]
pub struct PendingResponse {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<Response>>,
    table: Arc<PendingTable>,
    finished: bool,
}

impl PendingResponse {
    /// Id of the request this resolves
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(outcome) => {
                self.finished = true;
                // Sender dropped without resolving: the multiplexer went away
                Poll::Ready(outcome.unwrap_or(Err(DeliveryError::Shutdown)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.table.remove(&self.request_id);
        }
    }
}

/// Pending-request table shared by every channel
pub struct RequestMultiplexer {
    config: MultiplexerConfig,
    clock: SharedClock,
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
}

impl RequestMultiplexer {
    /// Create an empty table
    pub fn new(config: MultiplexerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Allocate an id and a pending entry expiring after `request_timeout`
    pub fn register(&self, channel_id: &ChannelId) -> (RequestId, PendingResponse) {
        let request_id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            request_id,
            Pending {
                channel_id: channel_id.clone(),
                deadline: self.clock.now() + self.config.request_timeout,
                tx,
            },
        );

        (
            request_id,
            PendingResponse {
                request_id,
                rx,
                table: Arc::clone(&self.pending),
                finished: false,
            },
        )
    }

    /// Deliver a response from the peer
    ///
    /// Returns `false` (and logs) when nothing is waiting for `request_id`.
    pub fn resolve(
        &self,
        channel_id: &ChannelId,
        request_id: RequestId,
        payload: Vec<u8>,
        error: Option<String>,
    ) -> bool {
        let Some((_, pending)) = self.pending.remove(&request_id) else {
            tracing::warn!(
                channel = %channel_id,
                request_id = %request_id,
                "Dropping unmatched response"
            );
            return false;
        };

        let outcome = match error {
            Some(reason) => Err(DeliveryError::Remote(reason)),
            None => Ok(Response {
                request_id,
                channel_id: channel_id.clone(),
                payload,
            }),
        };
        // Receiver may have been dropped concurrently
        let _ = pending.tx.send(outcome);
        true
    }

    /// Fail one request, e.g. because its transmission failed
    pub fn fail(&self, request_id: RequestId, err: DeliveryError) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every request past its deadline with `TimedOut`; returns the count
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut count = 0;
        for request_id in expired {
            let after = self.config.request_timeout;
            if self.fail(request_id, DeliveryError::TimedOut { request_id, after }) {
                tracing::debug!(request_id = %request_id, "Request timed out");
                count += 1;
            }
        }
        count
    }

    /// Fail every request waiting on `channel_id`
    pub fn fail_channel(&self, channel_id: &ChannelId, reason: &str) -> usize {
        let affected: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|e| e.value().channel_id == *channel_id)
            .map(|e| *e.key())
            .collect();

        affected
            .into_iter()
            .filter(|request_id| {
                self.fail(
                    *request_id,
                    DeliveryError::Transient {
                        channel_id: channel_id.clone(),
                        reason: reason.to_string(),
                    },
                )
            })
            .count()
    }

    /// Fail everything with `Shutdown`
    pub fn fail_all(&self) -> usize {
        let all: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        all.into_iter()
            .filter(|request_id| self.fail(*request_id, DeliveryError::Shutdown))
            .count()
    }

    /// Remove a request without resolving it
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Requests currently outstanding
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for RequestMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMultiplexer")
            .field("pending", &self.pending.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
