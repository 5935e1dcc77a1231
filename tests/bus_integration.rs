//! End-to-end scenarios driven over real loopback HTTP: an axum front-end
//! per bus, `reqwest` for the outbound leg. Covers spec §8 scenarios 1, 3,
//! 4, and 5 (auth-failure and crash-recovery are exercised at the unit
//! level in `transport::client` and `queue::engine` respectively).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use peerbus::bus::{Bus, BusBuilder, SendOptions};
use peerbus::config::{
    BusConfig, Credentials, EndpointConfig, MessageSpecification, SubscriptionConfig, TopicConfig,
};
use peerbus::error::{BusError, TransportError};
use peerbus::handler::{MessageContext, MessageHandler};
use peerbus::ids::{EndpointName, QueueName, TopicName};
use peerbus::queue::{InMemoryQueueStore, QueueOptions, QueuePersistence};
use peerbus::transport::{HttpTransport, InboundObserver, SubscriptionKind, Transport};

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn spawn_server(listener: TcpListener, bus: Arc<Bus>) {
    let observer: Arc<dyn InboundObserver> = bus;
    tokio::spawn(async move {
        let _ = axum::serve(listener, peerbus::transport::server::router(observer)).await;
    });
}

fn empty_config(base_uri: String) -> BusConfig {
    BusConfig {
        base_uri,
        reply_timeout_secs: 30,
        endpoints: vec![],
        topics: vec![],
        send_rules: vec![],
        subscriptions: vec![],
    }
}

#[derive(Serialize, Deserialize)]
struct PingRequest {
    int_data: i32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct TestReply {
    echo: i32,
}

struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, ctx: &MessageContext) -> Result<(), String> {
        let req: PingRequest = ctx.decode().map_err(|e| e.to_string())?;
        let bytes = serde_json::to_vec(&TestReply { echo: req.int_data }).map_err(|e| e.to_string())?;
        ctx.send_reply(bytes, "application/json").await.map_err(|e| e.to_string())?;
        ctx.acknowledge();
        Ok(())
    }
}

/// Scenario 1: simple send/reply between two busses on the same host.
#[tokio::test]
async fn simple_send_reply() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;

    let mut config_a = empty_config(format!("http://{addr_a}"));
    config_a.endpoints.push(EndpointConfig {
        name: EndpointName::from("B"),
        address: format!("http://{addr_b}"),
        credentials: Credentials::None,
    });
    let bus_a = BusBuilder::new(config_a).build().await.unwrap();

    let bus_b = BusBuilder::new(empty_config(format!("http://{addr_b}")))
        .add_handling_rule(
            MessageSpecification::Exact("Ping".to_string()),
            Arc::new(PingHandler),
            QueueName::from("inbound"),
            QueueOptions::default(),
        )
        .build()
        .await
        .unwrap();

    spawn_server(listener_a, bus_a.clone());
    spawn_server(listener_b, bus_b.clone());

    let cancel = CancellationToken::new();
    let sent = bus_a
        .send_to_endpoint(
            &EndpointName::from("B"),
            "Ping",
            &PingRequest { int_data: 42 },
            SendOptions::default(),
            &cancel,
        )
        .await
        .unwrap();

    let mut replies = Box::pin(sent.observe_replies().unwrap());
    let reply = tokio::time::timeout(Duration::from_secs(5), replies.next())
        .await
        .expect("reply within 5s")
        .expect("stream is not empty");
    let decoded: TestReply = serde_json::from_slice(&reply.bytes).unwrap();
    assert_eq!(decoded, TestReply { echo: 42 });

    assert!(
        tokio::time::timeout(Duration::from_millis(200), replies.next())
            .await
            .expect("stream completes promptly after the single reply")
            .is_none(),
        "stream should complete after NotifyLastReplyReceived"
    );

    bus_a.dispose();
    bus_b.dispose();
}

struct NeverAckHandler;

#[async_trait]
impl MessageHandler for NeverAckHandler {
    async fn handle(&self, _ctx: &MessageContext) -> Result<(), String> {
        Ok(())
    }
}

/// Scenario 3: non-durable send fails `NotAcknowledged`; durable send
/// returns immediately and the outbound queue retries to abandonment.
#[tokio::test]
async fn no_ack_then_durable_retry_and_abandon() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;

    let store_a = Arc::new(InMemoryQueueStore::new());
    let mut config_a = empty_config(format!("http://{addr_a}"));
    config_a.endpoints.push(EndpointConfig {
        name: EndpointName::from("B"),
        address: format!("http://{addr_b}"),
        credentials: Credentials::None,
    });
    let bus_a = BusBuilder::new(config_a)
        .with_queue_store(store_a.clone())
        .with_outbound_queue_options(QueueOptions {
            concurrency_limit: 1,
            auto_acknowledge: false,
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        })
        .build()
        .await
        .unwrap();

    let bus_b = BusBuilder::new(empty_config(format!("http://{addr_b}")))
        .add_handling_rule(
            MessageSpecification::Exact("NeverAck".to_string()),
            Arc::new(NeverAckHandler),
            QueueName::from("inbound"),
            QueueOptions::default(),
        )
        .build()
        .await
        .unwrap();

    spawn_server(listener_a, bus_a.clone());
    spawn_server(listener_b, bus_b.clone());

    let cancel = CancellationToken::new();

    let err = bus_a
        .send_to_endpoint(
            &EndpointName::from("B"),
            "NeverAck",
            &serde_json::json!({}),
            SendOptions::default(),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Transport(TransportError::NotAcknowledged)));

    let durable_options = SendOptions {
        use_durable_transport: true,
        ..SendOptions::default()
    };
    bus_a
        .send_to_endpoint(
            &EndpointName::from("B"),
            "NeverAck",
            &serde_json::json!({}),
            durable_options,
            &cancel,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let remaining = store_a
        .load_non_terminal(&QueueName::from("peerbus.outbound"))
        .await
        .unwrap();
    assert!(remaining.is_empty(), "message should have been abandoned after max_attempts");

    bus_a.dispose();
    bus_b.dispose();
}

struct RecordingHandler(Arc<AtomicUsize>);

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, ctx: &MessageContext) -> Result<(), String> {
        self.0.fetch_add(1, Ordering::SeqCst);
        ctx.acknowledge();
        Ok(())
    }
}

/// Scenario 4: a subscriber receives exactly one publish while subscribed,
/// then nothing once its subscription has expired without renewal.
#[tokio::test]
async fn publish_fanout_respects_subscription_ttl() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;

    let mut config_a = empty_config(format!("http://{addr_a}"));
    config_a.topics.push(TopicConfig { name: TopicName::from("T0") });
    let bus_a = BusBuilder::new(config_a).build().await.unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let bus_b = BusBuilder::new(empty_config(format!("http://{addr_b}")))
        .add_handling_rule(
            MessageSpecification::Exact("Note".to_string()),
            Arc::new(RecordingHandler(received.clone())),
            QueueName::from("inbound"),
            QueueOptions::default(),
        )
        .build()
        .await
        .unwrap();

    spawn_server(listener_a, bus_a.clone());
    spawn_server(listener_b, bus_b.clone());

    let cancel = CancellationToken::new();
    let direct_subscriber = HttpTransport::new();
    direct_subscriber
        .send_subscription_request(
            SubscriptionKind::Add,
            &format!("http://{addr_a}"),
            None,
            &TopicName::from("T0"),
            &format!("http://{addr_b}"),
            Some(Duration::from_millis(150)),
            &cancel,
        )
        .await
        .unwrap();

    bus_a
        .publish("T0", "Note", &serde_json::json!({"n": 1}), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(200)).await; // past the 150ms TTL, no renewal
    bus_a
        .publish("T0", "Note", &serde_json::json!({"n": 2}), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1, "expired subscriber must not receive the second publish");

    bus_a.dispose();
    bus_b.dispose();
}

/// Scenario 5: a configured subscription with an auto-renewing worker
/// outlives its own original TTL.
#[tokio::test]
async fn subscription_worker_renews_past_original_ttl() {
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;

    let mut config_a = empty_config(format!("http://{addr_a}"));
    config_a.topics.push(TopicConfig { name: TopicName::from("T0") });
    let bus_a = BusBuilder::new(config_a).build().await.unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let mut config_b = empty_config(format!("http://{addr_b}"));
    config_b.endpoints.push(EndpointConfig {
        name: EndpointName::from("A"),
        address: format!("http://{addr_a}"),
        credentials: Credentials::None,
    });
    config_b.subscriptions.push(SubscriptionConfig {
        endpoint: EndpointName::from("A"),
        topic: TopicName::from("T0"),
        ttl: Duration::from_millis(200),
    });
    let bus_b = BusBuilder::new(config_b)
        .add_handling_rule(
            MessageSpecification::Exact("Note".to_string()),
            Arc::new(RecordingHandler(received.clone())),
            QueueName::from("inbound"),
            QueueOptions::default(),
        )
        .build()
        .await
        .unwrap();

    spawn_server(listener_a, bus_a.clone());
    spawn_server(listener_b, bus_b.clone());

    // Outlast the original 200ms TTL by more than double; only a renewing
    // worker (rather than a one-shot subscribe) keeps the entry alive.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let cancel = CancellationToken::new();
    bus_a
        .publish("T0", "Note", &serde_json::json!({"n": 1}), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    bus_a.dispose();
    bus_b.dispose();
}
