use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::{ConnectionDescriptor, CorrelationId};
use courier_fabric::codec::JsonCodec;
use courier_fabric::{
    ClientConfig, Connection, Error, InboundRequest, Listener, ListenerConfig, ListenerEvents,
    ListenerRole, MemoryTransport, Outcome, ReplyMode, RequestResponseClient, Transport,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const ROUTE: &str = "mem://local";

/// Replies with the request payload prefixed by "re:"
struct Prefixer;

impl ListenerEvents for Prefixer {
    fn request_received(&self, request: InboundRequest) {
        tokio::spawn(async move {
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&request.payload);
            request.reply(&reply).await.unwrap();
        });
    }
}

/// Replies with the request payload after a delay
struct Slow(Duration);

impl ListenerEvents for Slow {
    fn request_received(&self, request: InboundRequest) {
        let delay = self.0;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = request.reply(&request.payload).await;
        });
    }
}

/// Never replies
struct BlackHole;

impl ListenerEvents for BlackHole {}

async fn server(
    transport: &MemoryTransport,
    queue: &str,
    events: Arc<dyn ListenerEvents>,
) -> Listener {
    let listener = Listener::new(
        ListenerConfig {
            destination: ConnectionDescriptor::new(ROUTE, queue),
            role: ListenerRole::RequestServer,
        },
        Arc::new(transport.clone()),
        events,
    );
    listener.start().await.unwrap();
    listener
}

fn config(mode: ReplyMode) -> ClientConfig {
    ClientConfig::builder()
        .sender(ConnectionDescriptor::new(ROUTE, "requests"))
        .receiver(ConnectionDescriptor::new(ROUTE, "replies"))
        .reply_mode(mode)
        .timeout(Duration::from_secs(5))
        .build()
}

async fn client(transport: &MemoryTransport, mode: ReplyMode) -> RequestResponseClient {
    RequestResponseClient::connect(config(mode), Arc::new(transport.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn shared_mode_roundtrip() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Prefixer)).await;
    let client = client(&transport, ReplyMode::Shared).await;

    let sent = client.send(b"P1").await.unwrap();
    assert!(!sent.is_partial());

    let outcome = client
        .receive(sent.correlation_id, Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Reply(b"re:P1".to_vec()));
    assert!(!client.is_pending(&sent.correlation_id));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn per_request_mode_roundtrip_tears_down_subscription() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Prefixer)).await;
    let client = client(&transport, ReplyMode::PerRequest).await;

    let sent = client.send(b"P1").await.unwrap();
    let reply_queue = format!("replies_{}", sent.correlation_id);

    let outcome = client
        .receive(sent.correlation_id, Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.reply().unwrap(), b"re:P1");
    assert_eq!(transport.subscriber_count(ROUTE, &reply_queue), 0);
    assert!(!client.is_pending(&sent.correlation_id));
}

#[tokio::test]
async fn per_request_round_trips_leave_no_reply_destinations() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Prefixer)).await;
    let client = client(&transport, ReplyMode::PerRequest).await;

    for i in 0..50 {
        let body = format!("m{i}");
        let reply = client
            .request(body.as_bytes(), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap()
            .into_reply()
            .unwrap();
        assert_eq!(reply, format!("re:m{i}").into_bytes());
    }

    // Only the request queue the server consumes remains
    assert_eq!(transport.destination_count(), 1);
}

#[tokio::test]
async fn late_reply_to_torn_down_reply_queue_is_dropped() {
    let transport = MemoryTransport::new();
    let _server = server(
        &transport,
        "requests",
        Arc::new(Slow(Duration::from_millis(200))),
    )
    .await;
    let client = client(&transport, ReplyMode::PerRequest).await;

    let sent = client.send(b"P").await.unwrap();
    let reply_queue = format!("replies_{}", sent.correlation_id);
    let outcome = client
        .receive(sent.correlation_id, Duration::from_millis(50), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Timeout);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(transport.backlog_len(ROUTE, &reply_queue), 0);
    assert_eq!(transport.destination_count(), 1);
}

#[tokio::test]
async fn many_requests_multiplex_over_shared_subscription() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Prefixer)).await;
    let client = Arc::new(client(&transport, ReplyMode::Shared).await);

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let c = client.clone();
            tokio::spawn(async move {
                let body = format!("m{i}");
                let reply = c
                    .request(body.as_bytes(), Duration::from_secs(5), &CancellationToken::new())
                    .await
                    .unwrap()
                    .into_reply()
                    .unwrap();
                assert_eq!(reply, format!("re:m{i}").into_bytes());
            })
        })
        .collect();

    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(client.in_flight(), 0);
    assert_eq!(transport.subscriber_count(ROUTE, "replies"), 1);

    let metrics = client.metrics();
    assert_eq!(metrics.requests_sent, 20);
    assert_eq!(metrics.replies_received, 20);
    assert!(metrics.peak_in_flight >= 1);
}

#[tokio::test]
async fn unanswered_request_times_out_and_is_forgotten() {
    for mode in [ReplyMode::Shared, ReplyMode::PerRequest] {
        let transport = MemoryTransport::new();
        let _server = server(&transport, "requests", Arc::new(BlackHole)).await;
        let client = client(&transport, mode).await;

        let sent = client.send(b"P").await.unwrap();
        let started = Instant::now();
        let outcome = client
            .receive(sent.correlation_id, Duration::from_millis(200), &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome, Outcome::Timeout);
        assert!(elapsed >= Duration::from_millis(150), "{:?}: {:?}", mode, elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}: {:?}", mode, elapsed);
        assert!(!client.is_pending(&sent.correlation_id));
        assert_eq!(client.metrics().timeouts, 1);
    }
}

#[tokio::test]
async fn receive_for_unknown_id_times_out_without_leaking() {
    let transport = MemoryTransport::new();
    let client = client(&transport, ReplyMode::Shared).await;
    let id = CorrelationId::new();

    let outcome = client
        .receive(id, Duration::from_millis(200), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_timeout());
    assert!(!client.is_pending(&id));
}

#[tokio::test]
async fn cancellation_tears_down_per_request_subscription() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(BlackHole)).await;
    let client = client(&transport, ReplyMode::PerRequest).await;

    let sent = client.send(b"P").await.unwrap();
    let reply_queue = format!("replies_{}", sent.correlation_id);

    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.cancel();
    });

    let outcome = client
        .receive(sent.correlation_id, Duration::from_secs(30), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(transport.subscriber_count(ROUTE, &reply_queue), 0);
    assert!(!client.is_pending(&sent.correlation_id));
    assert_eq!(client.metrics().cancellations, 1);
}

#[tokio::test]
async fn reply_arriving_before_receive_is_kept() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Prefixer)).await;
    let client = client(&transport, ReplyMode::Shared).await;

    let sent = client.send(b"early").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = client
        .receive(sent.correlation_id, Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Reply(b"re:early".to_vec()));
}

#[tokio::test]
async fn per_request_reply_published_before_subscribe_is_delivered() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Prefixer)).await;
    let client = client(&transport, ReplyMode::PerRequest).await;

    let sent = client.send(b"early").await.unwrap();
    // The reply waits in the per-request destination until receive() subscribes
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = client
        .receive(sent.correlation_id, Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Reply(b"re:early".to_vec()));
}

#[tokio::test]
async fn reply_is_kept_until_received_however_late() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Prefixer)).await;
    let config = ClientConfig::builder()
        .sender(ConnectionDescriptor::new(ROUTE, "requests"))
        .receiver(ConnectionDescriptor::new(ROUTE, "replies"))
        .timeout(Duration::from_millis(100))
        .build();
    let client = RequestResponseClient::connect(config, Arc::new(transport.clone()))
        .await
        .unwrap();

    let sent = client.send(b"P").await.unwrap();
    // Several sweep periods pass before the caller asks for the reply
    tokio::time::sleep(Duration::from_millis(450)).await;

    let started = Instant::now();
    let outcome = client
        .receive(sent.correlation_id, Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Reply(b"re:P".to_vec()));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn late_reply_after_timeout_is_swept() {
    let transport = MemoryTransport::new();
    let _server = server(
        &transport,
        "requests",
        Arc::new(Slow(Duration::from_millis(300))),
    )
    .await;
    let config = ClientConfig::builder()
        .sender(ConnectionDescriptor::new(ROUTE, "requests"))
        .receiver(ConnectionDescriptor::new(ROUTE, "replies"))
        .timeout(Duration::from_millis(100))
        .build();
    let client = RequestResponseClient::connect(config, Arc::new(transport.clone()))
        .await
        .unwrap();

    let outcome = client
        .request(b"P", Duration::from_millis(100), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Timeout);
    assert_eq!(client.in_flight(), 0);

    // The reply shows up after its caller left, then ages out
    let deadline = Instant::now() + Duration::from_secs(1);
    while client.in_flight() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.in_flight(), 1);

    let deadline = Instant::now() + Duration::from_secs(2);
    while client.in_flight() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn send_without_senders_fails() {
    let transport = MemoryTransport::new();
    let config = ClientConfig::builder()
        .receiver(ConnectionDescriptor::new(ROUTE, "replies"))
        .build();
    let client = RequestResponseClient::connect(config, Arc::new(transport))
        .await
        .unwrap();

    let err = client.send(b"x").await.unwrap_err();
    assert!(matches!(err, Error::NoSenderConfigured));
    assert!(err.is_configuration());
}

#[tokio::test]
async fn receive_without_receiver_fails_and_forgets_id() {
    let transport = MemoryTransport::new();
    let config = ClientConfig::builder()
        .sender(ConnectionDescriptor::new(ROUTE, "requests"))
        .build();
    let client = RequestResponseClient::connect(config, Arc::new(transport.clone()))
        .await
        .unwrap();

    // Fire-and-forget still works
    let sent = client.send(b"x").await.unwrap();
    assert_eq!(transport.backlog_len(ROUTE, "requests"), 1);
    assert_eq!(client.in_flight(), 0);

    let err = client
        .receive(sent.correlation_id, Duration::from_millis(10), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoReceiverConfigured));
    assert!(!client.is_pending(&sent.correlation_id));
}

#[tokio::test]
async fn partial_publish_failure_is_reported() {
    let transport = MemoryTransport::new();
    transport.fail_destination("broken", "unreachable");
    let config = ClientConfig::builder()
        .sender(ConnectionDescriptor::new(ROUTE, "requests"))
        .sender(ConnectionDescriptor::new(ROUTE, "broken"))
        .receiver(ConnectionDescriptor::new(ROUTE, "replies"))
        .build();
    let client = RequestResponseClient::connect(config, Arc::new(transport.clone()))
        .await
        .unwrap();

    let sent = client.send(b"x").await.unwrap();
    assert!(sent.is_partial());
    let failures = sent.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].destination, "mem://local/broken");
    assert_eq!(transport.backlog_len(ROUTE, "requests"), 1);
    assert!(client.is_pending(&sent.correlation_id));
}

#[tokio::test]
async fn total_publish_failure_is_an_error_and_leaves_nothing_pending() {
    let transport = MemoryTransport::new();
    transport.fail_destination("requests", "unreachable");
    let client = client(&transport, ReplyMode::Shared).await;

    match client.send(b"x").await {
        Err(Error::Publish { failures }) => assert_eq!(failures.len(), 1),
        other => panic!("Expected Publish error, got {:?}", other),
    }
    assert_eq!(client.in_flight(), 0);
    assert_eq!(client.metrics().transport_errors, 1);
}

#[tokio::test]
async fn subscription_failure_fails_in_flight_receive() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(BlackHole)).await;
    let client = Arc::new(client(&transport, ReplyMode::Shared).await);

    let sent = client.send(b"x").await.unwrap();
    let c = client.clone();
    let waiter = tokio::spawn(async move {
        c.receive(sent.correlation_id, Duration::from_secs(30), &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.fail_subscribers("replies", "connection reset");

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Transport { .. })));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn malformed_reply_is_counted_and_ignored() {
    let transport = MemoryTransport::new();
    let client = client(&transport, ReplyMode::Shared).await;

    let conn = transport.open(ROUTE).await.unwrap();
    conn.publish("replies", b"garbage").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.metrics().malformed, 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn close_cancels_waiters_and_disables_receive() {
    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(BlackHole)).await;
    let client = Arc::new(client(&transport, ReplyMode::Shared).await);

    let sent = client.send(b"x").await.unwrap();
    let c = client.clone();
    let waiter = tokio::spawn(async move {
        c.receive(sent.correlation_id, Duration::from_secs(30), &CancellationToken::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await;
    client.close().await;

    assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Cancelled);
    assert_eq!(transport.subscriber_count(ROUTE, "replies"), 0);
    assert!(matches!(client.send(b"y").await, Err(Error::ShutDown)));

    let err = client
        .receive(CorrelationId::new(), Duration::from_millis(10), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoReceiverConfigured));
}

#[tokio::test]
async fn typed_call_uses_payload_codec() {
    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Add {
        a: i32,
        b: i32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sum {
        total: i32,
    }

    struct Adder;

    impl ListenerEvents for Adder {
        fn request_received(&self, request: InboundRequest) {
            tokio::spawn(async move {
                let add: Add = serde_json::from_slice(&request.payload).unwrap();
                let sum = serde_json::to_vec(&Sum { total: add.a + add.b }).unwrap();
                request.reply(&sum).await.unwrap();
            });
        }
    }

    let transport = MemoryTransport::new();
    let _server = server(&transport, "requests", Arc::new(Adder)).await;
    let client = RequestResponseClient::connect_with_codec(
        config(ReplyMode::Shared),
        Arc::new(transport.clone()),
        JsonCodec,
    )
    .await
    .unwrap();

    let outcome: Outcome<Sum> = client
        .call(&Add { a: 2, b: 40 }, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Reply(Sum { total: 42 }));
}

#[tokio::test]
async fn config_deserializes_with_defaults() {
    let config: ClientConfig = serde_json::from_str(
        r#"{
            "senders": [{"route": "mem://local", "name": "requests"}],
            "receiver": {"route": "mem://local", "name": "replies"},
            "reply_mode": "per_request"
        }"#,
    )
    .unwrap();

    assert_eq!(config.reply_mode, ReplyMode::PerRequest);
    assert_eq!(config.timeout(), Duration::from_secs(30));
    assert_eq!(config.pool.max_connections, 16);
    assert!(config.pool.checkout_timeout().is_none());
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn invalid_descriptor_is_rejected_at_connect() {
    let config = ClientConfig::builder()
        .sender(ConnectionDescriptor::new("", "requests"))
        .build();
    let result = RequestResponseClient::connect(config, Arc::new(MemoryTransport::new())).await;
    assert!(matches!(result, Err(Error::Core(_))));
}
