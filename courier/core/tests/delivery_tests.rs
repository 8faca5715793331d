//! End-to-end delivery tests
//!
//! Two couriers connected by in-memory channels exchange requests, batched
//! messages and streams. Tests cover:
//! - Request/response correlation under concurrency
//! - Low-priority batching and ordering
//! - Failover away from a broken channel
//! - Windowed stream transfer
//! - Request timeouts, cancellation and stalled channels
//! - Metrics, SLA status and Prometheus exposition

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use courier_core::{
    ChannelId, ChannelKind, Courier, CourierConfig, DeliveryError, Incoming, Priority, StreamChannel,
    StreamConfig, StreamMetadata, SystemClock,
};

const DESTINATION: &str = "svc";
const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Test Infrastructure
// =============================================================================

fn fast_config() -> CourierConfig {
    let mut config = CourierConfig::default();
    config.failover.retry.base_delay = Duration::from_millis(5);
    config.failover.retry.max_delay = Duration::from_millis(20);
    config.failover.batch.max_batch_delay = Duration::from_millis(20);
    config.multiplexer.sweep_interval = Duration::from_millis(10);
    config.routing.enable_load_balancing = false;
    config
}

/// Connect `client` to `server` with one in-memory channel
///
/// The client side serves `DESTINATION`; the server side serves anything.
fn link(client: &Courier, server: &Courier, id: &str) {
    let performance = client.config().failover.performance.clone();
    let (local, remote) = StreamChannel::in_process_pair(
        id.into(),
        format!("{id}-remote").as_str().into(),
        ChannelKind::Ipc,
        &performance,
    );
    client
        .register_transport(Arc::new(local), vec![DESTINATION.to_string()])
        .unwrap();
    server
        .register_transport(Arc::new(remote), Vec::new())
        .unwrap();
}

/// Register a client channel whose peer end is already gone
fn link_broken(client: &Courier, id: &str) {
    let performance = client.config().failover.performance.clone();
    let (local, remote) = StreamChannel::in_process_pair(
        id.into(),
        "gone".into(),
        ChannelKind::Tcp,
        &performance,
    );
    drop(remote);
    client
        .register_transport(Arc::new(local), vec![DESTINATION.to_string()])
        .unwrap();
}

/// Answer every request with `pong:<payload>`; forward everything else
fn spawn_responder(server: Arc<Courier>) -> mpsc::UnboundedReceiver<Incoming> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut incoming = server.incoming().unwrap();

    tokio::spawn(async move {
        while let Some(item) = incoming.next().await {
            match item {
                Incoming::Request {
                    channel_id,
                    request_id,
                    message,
                } => {
                    let mut payload = b"pong:".to_vec();
                    payload.extend_from_slice(&message.payload);
                    server
                        .respond(&channel_id, request_id, payload)
                        .await
                        .unwrap();
                }
                other => {
                    let _ = tx.send(other);
                }
            }
        }
    });

    rx
}

async fn next_incoming(rx: &mut mpsc::UnboundedReceiver<Incoming>) -> Incoming {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for peer traffic")
        .expect("responder stopped")
}

// =============================================================================
// Test 1: Request/Response Correlation
// =============================================================================

/// Concurrent requests over one channel each get their own response.
#[tokio::test]
async fn test_concurrent_requests_are_correlated() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    let server = Arc::new(Courier::new(fast_config(), SystemClock::shared()));
    link(&client, &server, "a");
    let _rx = spawn_responder(Arc::clone(&server));

    let requests = (0..20).map(|i| {
        let client = &client;
        async move {
            let payload = format!("req-{i}").into_bytes();
            let response = client.send(DESTINATION, payload, Priority::Normal).await?;
            Ok::<_, DeliveryError>((i, response))
        }
    });

    let results = tokio::time::timeout(WAIT, futures::future::join_all(requests))
        .await
        .unwrap();

    for result in results {
        let (i, response) = result.unwrap();
        assert_eq!(response.payload, format!("pong:req-{i}").into_bytes());
        assert_eq!(response.channel_id.as_str(), "a");
    }
    assert_eq!(client.pending_requests(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

/// A destination with no serving channel fails immediately.
#[tokio::test]
async fn test_unknown_destination_has_no_channel() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    let server = Arc::new(Courier::new(fast_config(), SystemClock::shared()));
    link(&client, &server, "a");

    let err = client
        .send("elsewhere", b"x".to_vec(), Priority::High)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::NoChannel { .. }), "{err:?}");

    client.shutdown().await;
    server.shutdown().await;
}

// =============================================================================
// Test 2: Batching
// =============================================================================

/// Low-priority posts are buffered, flushed by age, and arrive in order.
#[tokio::test]
async fn test_low_priority_posts_arrive_in_order() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    let server = Arc::new(Courier::new(fast_config(), SystemClock::shared()));
    link(&client, &server, "a");
    let mut rx = spawn_responder(Arc::clone(&server));

    for i in 0..5u8 {
        client
            .post(DESTINATION, vec![i], Priority::Low)
            .await
            .unwrap();
    }

    for expected in 0..5u8 {
        match next_incoming(&mut rx).await {
            Incoming::Message { channel_id, message } => {
                assert_eq!(channel_id.as_str(), "a-remote");
                assert_eq!(message.payload, vec![expected]);
                assert_eq!(message.priority, Priority::Low);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    client.shutdown().await;
    server.shutdown().await;
}

/// Normal-priority posts go out immediately.
#[tokio::test]
async fn test_normal_post_is_not_batched() {
    let mut config = fast_config();
    config.failover.batch.max_batch_delay = Duration::from_secs(60);
    let client = Courier::new(config, SystemClock::shared());
    let server = Arc::new(Courier::new(fast_config(), SystemClock::shared()));
    link(&client, &server, "a");
    let mut rx = spawn_responder(Arc::clone(&server));

    client
        .post(DESTINATION, b"now".to_vec(), Priority::Normal)
        .await
        .unwrap();

    match next_incoming(&mut rx).await {
        Incoming::Message { message, .. } => assert_eq!(message.payload, b"now"),
        other => panic!("unexpected {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
}

// =============================================================================
// Test 3: Failover
// =============================================================================

/// A request routed to a dead channel is retried on the healthy alternate.
#[tokio::test]
async fn test_failover_to_alternate_channel() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    let server = Arc::new(Courier::new(fast_config(), SystemClock::shared()));
    // "a" sorts first, so it is the initial choice with load balancing off
    link_broken(&client, "a");
    link(&client, &server, "b");
    let _rx = spawn_responder(Arc::clone(&server));

    let response = tokio::time::timeout(
        WAIT,
        client.send(DESTINATION, b"hello".to_vec(), Priority::High),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.payload, b"pong:hello");
    assert_eq!(response.channel_id.as_str(), "b");

    let broken = client
        .breaker_snapshots()
        .into_iter()
        .find(|s| s.channel_id.as_str() == "a")
        .unwrap();
    assert!(broken.total_failures >= 1);

    // The router learned from the failure
    let response = client
        .send(DESTINATION, b"again".to_vec(), Priority::High)
        .await
        .unwrap();
    assert_eq!(response.channel_id.as_str(), "b");

    client.shutdown().await;
    server.shutdown().await;
}

/// With only a dead channel the caller sees the exhausted retry.
#[tokio::test]
async fn test_single_dead_channel_exhausts_retries() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    link_broken(&client, "a");

    let err = tokio::time::timeout(
        WAIT,
        client.send(DESTINATION, b"x".to_vec(), Priority::Normal),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(
        matches!(
            err,
            DeliveryError::RetryExhausted { .. } | DeliveryError::Transient { .. }
        ),
        "{err:?}"
    );

    client.shutdown().await;
}

// =============================================================================
// Test 4: Streaming
// =============================================================================

/// A multi-chunk stream is reassembled on the peer and surfaced as incoming.
#[tokio::test]
async fn test_stream_transfer_end_to_end() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    let server = Arc::new(Courier::new(fast_config(), SystemClock::shared()));
    link(&client, &server, "a");
    let mut rx = spawn_responder(Arc::clone(&server));

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let stream_config = StreamConfig {
        max_chunk_size: 1024,
        window_size: 4,
        ..StreamConfig::default()
    };

    let mut sender = client
        .open_stream(
            DESTINATION,
            StreamMetadata::new(data.len() as u64, "application/octet-stream")
                .with_property("name", "blob"),
            Some(stream_config),
        )
        .await
        .unwrap();
    for piece in data.chunks(3000) {
        sender.write(piece).await.unwrap();
    }
    let summary = tokio::time::timeout(WAIT, sender.close())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.total_bytes, data.len() as u64);
    assert_eq!(summary.chunks, 10);

    match next_incoming(&mut rx).await {
        Incoming::Stream(done) => {
            assert_eq!(done.data, data);
            assert_eq!(done.metadata.content_type, "application/octet-stream");
            assert_eq!(done.metadata.properties.get("name").unwrap(), "blob");
            assert_eq!(done.channel_id.as_str(), "a-remote");
        }
        other => panic!("unexpected {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
}

// =============================================================================
// Test 5: Timeouts and Shutdown
// =============================================================================

/// A request the peer never answers times out and is not replayed.
#[tokio::test]
async fn test_unanswered_request_times_out() {
    let mut config = fast_config();
    config.multiplexer.request_timeout = Duration::from_millis(100);
    let client = Courier::new(config, SystemClock::shared());
    let server = Courier::new(fast_config(), SystemClock::shared());
    link(&client, &server, "a");
    // Nobody consumes the server's incoming stream

    let err = tokio::time::timeout(
        WAIT,
        client.send(DESTINATION, b"hello".to_vec(), Priority::Normal),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, DeliveryError::TimedOut { .. }), "{err:?}");
    assert_eq!(client.pending_requests(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

/// Abandoning a request releases its entry in the pending table.
#[tokio::test]
async fn test_cancelled_request_leaves_pending_table() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    let server = Courier::new(fast_config(), SystemClock::shared());
    link(&client, &server, "a");
    // Nobody answers, and the default request timeout is far away

    {
        let send = client.send(DESTINATION, b"hello".to_vec(), Priority::Normal);
        tokio::pin!(send);
        let abandoned = tokio::time::timeout(Duration::from_millis(200), &mut send).await;
        assert!(abandoned.is_err());
        assert_eq!(client.pending_requests(), 1);
    }

    let released = tokio::time::timeout(WAIT, async {
        while client.pending_requests() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "cancelled request still pending");

    client.shutdown().await;
    server.shutdown().await;
}

/// A peer that stops reading cannot hold a request past its deadline.
#[tokio::test]
async fn test_request_over_stalled_channel_times_out() {
    let mut config = fast_config();
    config.multiplexer.request_timeout = Duration::from_millis(100);
    let client = Courier::new(config, SystemClock::shared());

    // The far end stays open but is never read, so the 64-byte pipe fills
    let (near, _far) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(near);
    let stalled = StreamChannel::from_split(
        "stalled".into(),
        ChannelKind::Tcp,
        reader,
        writer,
        &client.config().failover.performance,
    );
    client
        .register_transport(Arc::new(stalled), vec![DESTINATION.to_string()])
        .unwrap();

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        client.send(DESTINATION, vec![7; 256], Priority::Normal),
    )
    .await
    .expect("send unresolved after request timeout")
    .unwrap_err();
    assert!(matches!(err, DeliveryError::TimedOut { .. }), "{err:?}");
    assert_eq!(client.pending_requests(), 0);

    // The half-written frame took the channel down; later sends fail fast
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        client.send(DESTINATION, b"again".to_vec(), Priority::Normal),
    )
    .await
    .expect("send on downed channel unresolved")
    .unwrap_err();
    assert!(matches!(err, DeliveryError::RetryExhausted { .. }), "{err:?}");

    client.shutdown().await;
}

/// After shutdown every entry point reports `Shutdown`.
#[tokio::test]
async fn test_send_after_shutdown_fails() {
    let client = Courier::new(fast_config(), SystemClock::shared());
    let server = Courier::new(fast_config(), SystemClock::shared());
    link(&client, &server, "a");

    client.shutdown().await;
    // Idempotent
    client.shutdown().await;

    let err = client
        .send(DESTINATION, b"x".to_vec(), Priority::Critical)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Shutdown));
    let err = client
        .post(DESTINATION, b"x".to_vec(), Priority::Low)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Shutdown));

    server.shutdown().await;
}

// =============================================================================
// Test 6: Observability
// =============================================================================

/// Completed traffic shows up in metrics, SLA status and the exposition.
#[tokio::test]
async fn test_metrics_and_sla_reflect_traffic() {
    let mut config = fast_config();
    config.monitor.min_samples = 3;
    let client = Courier::new(config, SystemClock::shared());
    let server = Arc::new(Courier::new(fast_config(), SystemClock::shared()));
    link(&client, &server, "a");
    let _rx = spawn_responder(Arc::clone(&server));

    for i in 0..5u8 {
        client
            .send(DESTINATION, vec![i], Priority::Normal)
            .await
            .unwrap();
    }

    let metrics = client.get_metrics();
    let metric = metrics
        .iter()
        .find(|m| m.channel_id.as_str() == "a")
        .unwrap();
    assert_eq!(metric.messages_sent, 5);
    assert_eq!(metric.messages_received, 5);
    assert_eq!(metric.failures, 0);
    assert!((metric.availability - 1.0).abs() < f64::EPSILON);

    let sla = client.get_sla_status();
    let status = sla.get(&ChannelId::from("a")).unwrap();
    let report = status.report().expect("enough samples for a verdict");
    assert!(report.availability_status.compliant);
    assert!(report.error_rate_status.compliant);

    let comparison = client.get_performance_comparison();
    assert_eq!(
        comparison.best_availability.as_ref().map(|r| r.channel_id.as_str()),
        Some("a")
    );

    let exposition = client.prometheus();
    assert!(exposition.contains("courier_messages_sent_total{channel=\"a\"} 5"));
    assert!(exposition.contains("courier_circuit_state{channel=\"a\"} 0"));
    assert!(client.recent_alerts().is_empty());

    client.shutdown().await;
    server.shutdown().await;
}
