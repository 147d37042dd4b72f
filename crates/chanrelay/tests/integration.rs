mod common;

use async_trait::async_trait;
use chanrelay::broker::{Broker, BrokerEvent, Subscriber};
use chanrelay::error::BrokerError;
use chanrelay::MemoryBroker;
use common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[tokio::test]
async fn broker_event_is_delivered_once() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 1).await;

    server.broker.publish("room-1", "hi").await.unwrap();

    assert_eq!(client.recv_content().await, "hi");
    assert!(client
        .recv_content_timeout(Duration::from_millis(200))
        .await
        .is_none());
}

#[tokio::test]
async fn client_message_is_published_once() {
    let server = start_server().await;
    let observer = server.broker.connect().await.unwrap();
    observer.subscribe("room-1").await.unwrap();
    assert!(matches!(
        observer.receive().await,
        BrokerEvent::SubscriptionAck { .. }
    ));

    let mut client = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 1).await;
    client.publish("room-1", "hello").await;

    let event = tokio::time::timeout(Duration::from_secs(5), observer.receive())
        .await
        .unwrap();
    assert_eq!(
        event,
        BrokerEvent::Content {
            channel: "room-1".into(),
            content: "hello".into()
        }
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.broker.published_total(), 1);
}

#[tokio::test]
async fn fan_out_reaches_every_session_on_channel() {
    let server = start_server().await;
    let mut first = TestClient::connect(&server.addr, "room-1").await;
    let mut second = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 2).await;

    server.broker.publish("room-1", "to both").await.unwrap();
    assert_eq!(first.recv_content().await, "to both");
    assert_eq!(second.recv_content().await, "to both");

    first.close().await;
    server.wait_for_sessions("room-1", 1).await;

    server.broker.publish("room-1", "to one").await.unwrap();
    assert_eq!(second.recv_content().await, "to one");
    assert!(second
        .recv_content_timeout(Duration::from_millis(200))
        .await
        .is_none());
}

#[tokio::test]
async fn dropped_connection_leaves_registry() {
    let server = start_server().await;
    let _stay = TestClient::connect(&server.addr, "room-1").await;
    let leave = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 2).await;
    assert_eq!(server.state.registry.count(), 2);

    drop(leave);

    server.wait_for_sessions("room-1", 1).await;
    assert_eq!(server.state.registry.count(), 1);
    assert_eq!(server.state.subscriptions.refs("room-1").await, 1);
}

#[tokio::test]
async fn last_session_leaving_releases_subscription() {
    let server = start_server().await;
    let client = TestClient::connect(&server.addr, "solo").await;
    server.wait_for_sessions("solo", 1).await;
    assert_eq!(server.state.subscriptions.refs("solo").await, 1);

    client.close().await;
    server.wait_for_sessions("solo", 0).await;
    let state = server.state.clone();
    for _ in 0..100 {
        if state.subscriptions.refs("solo").await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.subscriptions.channel_count().await, 0);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn sessions_publish_across_channels_without_leaking() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server.addr, "alice").await;
    let mut bob = TestClient::connect(&server.addr, "bob").await;
    server.wait_for_sessions("alice", 1).await;
    server.wait_for_sessions("bob", 1).await;

    alice.publish("bob", "hey bob").await;
    assert_eq!(bob.recv_content().await, "hey bob");
    assert!(alice
        .recv_content_timeout(Duration::from_millis(200))
        .await
        .is_none());

    bob.publish("alice", "hey alice").await;
    assert_eq!(alice.recv_content().await, "hey alice");
}

#[tokio::test]
async fn own_channel_only_drops_foreign_publish() {
    let server = start_server_with(|c| c.own_channel_only = true).await;
    let mut alice = TestClient::connect(&server.addr, "alice").await;
    let mut bob = TestClient::connect(&server.addr, "bob").await;
    server.wait_for_sessions("alice", 1).await;
    server.wait_for_sessions("bob", 1).await;

    alice.publish("bob", "not allowed").await;
    alice.publish("alice", "echo").await;

    assert_eq!(alice.recv_content().await, "echo");
    assert!(bob
        .recv_content_timeout(Duration::from_millis(200))
        .await
        .is_none());
    assert_eq!(server.broker.published_total(), 1);
}

#[tokio::test]
async fn malformed_message_keeps_session_open() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 1).await;

    client.send_raw("not json").await;
    client.send_raw(r#"{"content":"missing id"}"#).await;
    client.publish("room-1", "still here").await;

    assert_eq!(client.recv_content().await, "still here");
    assert_eq!(server.state.registry.count(), 1);
    assert_eq!(server.broker.published_total(), 1);
}

#[tokio::test]
async fn publish_failure_keeps_session_open() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 1).await;

    server.broker.reject_publishes(true);
    client.publish("room-1", "lost").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.broker.reject_publishes(false);
    client.publish("room-1", "kept").await;

    assert_eq!(client.recv_content().await, "kept");
    assert_eq!(server.state.registry.count(), 1);
}

#[tokio::test]
async fn subscription_failure_rejects_only_that_connection() {
    let server = start_server().await;
    let mut existing = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 1).await;

    server.broker.reject_subscriptions(true);
    let mut rejected = TestClient::connect(&server.addr, "room-2").await;
    let frame = rejected.recv_close().await.expect("expected a close frame");
    assert_eq!(frame.code, CloseCode::Error);
    assert_eq!(server.state.registry.channel_len("room-2"), 0);
    assert_eq!(server.state.registry.count(), 1);

    server.broker.publish("room-1", "unaffected").await.unwrap();
    assert_eq!(existing.recv_content().await, "unaffected");
}

#[tokio::test]
async fn missing_channel_id_is_rejected_at_handshake() {
    let server = start_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected HTTP 400, got {other:?}"),
    }

    let result =
        tokio_tungstenite::connect_async(format!("ws://{}/other?id=x", server.addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP 404, got {other:?}"),
    }
    assert!(server.state.registry.is_empty());
}

#[tokio::test]
async fn delivery_resumes_after_broker_reconnect() {
    let server = start_server().await;
    let mut client = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 1).await;

    server.broker.sever();
    let probe = server.broker.clone();
    wait_until(|| probe.connects_total() >= 2).await;
    let health = server.state.health.clone();
    wait_until(|| health.is_ready()).await;

    server.broker.publish("room-1", "back").await.unwrap();
    assert_eq!(client.recv_content().await, "back");
    assert_eq!(server.state.registry.count(), 1);
}

#[tokio::test]
async fn per_ip_limit_turns_away_extra_connections() {
    let server = start_server_with(|c| c.max_conns_ip = 1).await;
    let _first = TestClient::connect(&server.addr, "room-1").await;
    server.wait_for_sessions("room-1", 1).await;

    let second = tokio_tungstenite::connect_async(format!("ws://{}/ws?id=room-1", server.addr)).await;
    assert!(second.is_err());
    assert_eq!(server.state.registry.count(), 1);
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let server = start_server().await;
    let mut a = TestClient::connect(&server.addr, "room-1").await;
    let mut b = TestClient::connect(&server.addr, "room-2").await;
    server.wait_for_sessions("room-1", 1).await;
    server.wait_for_sessions("room-2", 1).await;
    let state = server.state.clone();

    server.shutdown().await;

    let _ = a.recv_close().await;
    let _ = b.recv_close().await;
    assert!(state.registry.is_empty());
    assert_eq!(state.subscriptions.channel_count().await, 0);
}

#[tokio::test]
async fn idle_session_is_closed() {
    let server = start_server_with(|c| {
        c.ping_interval = 1;
        c.idle_timeout = 1;
    })
    .await;
    let mut client = TestClient::connect(&server.addr, "quiet").await;
    server.wait_for_sessions("quiet", 1).await;

    server.wait_for_sessions("quiet", 0).await;
    assert!(server.state.registry.is_empty());
    let _ = client.recv_close().await;
}

/// Holds subscribe requests for one channel until permits are added.
struct GatedBroker {
    inner: MemoryBroker,
    channel: &'static str,
    gate: Arc<Semaphore>,
    waiting: Arc<AtomicBool>,
}

struct GatedSubscriber {
    inner: Arc<dyn Subscriber>,
    channel: &'static str,
    gate: Arc<Semaphore>,
    waiting: Arc<AtomicBool>,
}

#[async_trait]
impl Broker for GatedBroker {
    async fn publish(&self, channel: &str, content: &str) -> Result<(), BrokerError> {
        self.inner.publish(channel, content).await
    }

    async fn connect(&self) -> Result<Arc<dyn Subscriber>, BrokerError> {
        Ok(Arc::new(GatedSubscriber {
            inner: self.inner.connect().await?,
            channel: self.channel,
            gate: Arc::clone(&self.gate),
            waiting: Arc::clone(&self.waiting),
        }))
    }
}

#[async_trait]
impl Subscriber for GatedSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        if channel == self.channel {
            self.waiting.store(true, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
        }
        self.inner.subscribe(channel).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.inner.unsubscribe(channel).await
    }

    async fn receive(&self) -> BrokerEvent {
        self.inner.receive().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[tokio::test]
async fn session_subscribing_during_shutdown_is_closed() {
    let memory = MemoryBroker::new();
    let gate = Arc::new(Semaphore::new(0));
    let waiting = Arc::new(AtomicBool::new(false));
    let broker = GatedBroker {
        inner: memory.clone(),
        channel: "late",
        gate: Arc::clone(&gate),
        waiting: Arc::clone(&waiting),
    };
    let server = start_server_on(Arc::new(broker), memory, |_| {}).await;
    let state = server.state.clone();

    let mut client = TestClient::connect(&server.addr, "late").await;
    let probe = Arc::clone(&waiting);
    wait_until(|| probe.load(Ordering::SeqCst)).await;

    let shutdown = tokio::spawn(server.shutdown());
    let draining = state.clone();
    wait_until(|| draining.registry.is_draining()).await;
    gate.add_permits(1);

    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("shutdown waited for the drain timeout")
        .unwrap();

    let frame = client.recv_close().await.expect("expected a close frame");
    assert_eq!(frame.code, CloseCode::Away);
    assert!(state.registry.is_empty());
    assert_eq!(state.subscriptions.channel_count().await, 0);
}
