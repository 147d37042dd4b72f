#![allow(dead_code)]

use chanrelay::config::RelayConfig;
use chanrelay::metrics::HealthState;
use chanrelay::{Broker, MemoryBroker, RelayState};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config(listen: SocketAddr) -> RelayConfig {
    RelayConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        reconnect_initial_ms: 10,
        reconnect_max_ms: 50,
        ..RelayConfig::default()
    }
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<RelayState>,
    pub broker: MemoryBroker,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Wait until `channel` has exactly `n` registered sessions.
    pub async fn wait_for_sessions(&self, channel: &str, n: usize) {
        let state = Arc::clone(&self.state);
        wait_until(|| state.registry.channel_len(channel) == n).await;
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), &mut self.handle)
            .await
            .expect("server did not shut down")
            .unwrap();
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(configure: impl FnOnce(&mut RelayConfig)) -> TestServer {
    let broker = MemoryBroker::new();
    start_server_on(Arc::new(broker.clone()), broker, configure).await
}

/// Start a server that talks to `relay_broker`, which must route through
/// `broker` so startup can be observed.
pub async fn start_server_on(
    relay_broker: Arc<dyn Broker>,
    broker: MemoryBroker,
    configure: impl FnOnce(&mut RelayConfig),
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    configure(&mut config);

    let state = Arc::new(RelayState::new(config, relay_broker, HealthState::new()));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_state = Arc::clone(&state);
    let handle = tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = chanrelay::run_with_shutdown(listener, server_state, shutdown).await {
            eprintln!("server error in test: {e}");
        }
    });

    let probe = broker.clone();
    wait_until(|| probe.connects_total() >= 1).await;

    TestServer {
        addr,
        state,
        broker,
        shutdown_tx: Some(shutdown_tx),
        handle,
    }
}

pub struct TestClient {
    pub ws: ClientStream,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr, channel: &str) -> Self {
        let url = format!("ws://{addr}/ws?id={channel}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self { ws }
    }

    pub async fn publish(&mut self, id: &str, content: &str) {
        let body = serde_json::json!({ "id": id, "content": content }).to_string();
        self.send_raw(body).await;
    }

    pub async fn send_raw(&mut self, text: impl Into<String>) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Next delivered `content`, skipping keepalives.
    pub async fn recv_content(&mut self) -> String {
        self.recv_content_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for delivery")
    }

    pub async fn recv_content_timeout(&mut self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()?;
            match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    return Some(value["content"].as_str().unwrap().to_string());
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("expected a delivery, got {other:?}"),
            }
        }
    }

    /// Read until the server closes; returns the close frame if one was sent.
    pub async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(msg) = self.ws.next().await {
                match msg {
                    Ok(Message::Close(frame)) => return frame,
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
            None
        })
        .await;
        result.expect("timeout waiting for close")
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
