use crate::error::RelayError;
use crate::message::{ClientMessage, Delivery};
use crate::metrics::{counters, gauges};
use crate::ratelimit::PublishLimiter;
use crate::server::RelayState;
use crate::session::{Session, SocketEndpoint, SocketHandle};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Path the WebSocket endpoint is served on.
pub const WS_PATH: &str = "/ws";

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsRecv<S> = SplitStream<WebSocketStream<S>>;

/// Holds one slot of the total and per-IP connection budgets.
struct AdmissionGuard {
    state: Arc<RelayState>,
    ip: IpAddr,
}

impl AdmissionGuard {
    fn admit(state: &Arc<RelayState>, ip: IpAddr) -> Result<Self, RelayError> {
        let max_conns = state.config.max_conns;
        if state.active_connections.fetch_add(1, Ordering::SeqCst) >= max_conns {
            state.active_connections.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::Rejected("connection limit reached"));
        }

        let mut over_ip_limit = false;
        match state.ip_connections.entry(ip) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    over_ip_limit = true;
                } else {
                    *entry.get_mut() += 1;
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
        if over_ip_limit {
            state.active_connections.fetch_sub(1, Ordering::SeqCst);
            debug!(ip = %ip, limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
            return Err(RelayError::Rejected("per-IP connection limit reached"));
        }

        Ok(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::SeqCst);
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            remove = *entry == 0;
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Pull the channel identifier out of `/ws?id=<channel>`.
fn channel_from_request(req: &Request) -> Result<String, ErrorResponse> {
    if req.uri().path() != WS_PATH {
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }
    let channel = req.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
    });
    match channel {
        Some(channel) if !channel.is_empty() => Ok(channel),
        _ => Err(reject(StatusCode::BAD_REQUEST, "missing channel id")),
    }
}

/// Close codes that mean the client simply went away.
fn is_ordinary_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Normal | CloseCode::Away | CloseCode::Status)
}

fn log_close(session: &Session, frame: Option<&CloseFrame<'_>>) {
    match frame {
        Some(frame) if !is_ordinary_close(frame.code) => {
            warn!(
                session = %session.id(),
                channel = session.channel(),
                code = u16::from(frame.code),
                reason = %frame.reason,
                "client closed connection with error code"
            );
        }
        _ => debug!(session = %session.id(), channel = session.channel(), "client closed connection"),
    }
}

/// Accept one TCP connection: admission, upgrade, then the session lifecycle.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<RelayState>,
) -> Result<(), RelayError> {
    let _admission = AdmissionGuard::admit(&state, peer_addr.ip()).inspect_err(|_| {
        counters::connections_total("rejected");
    })?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message),
        max_frame_size: Some(state.config.max_message),
        ..WebSocketConfig::default()
    };

    let channel_cell = Arc::new(OnceLock::new());
    let cell = Arc::clone(&channel_cell);
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| {
            let channel = channel_from_request(req)?;
            let _ = cell.set(channel);
            Ok(resp)
        },
        Some(ws_config),
    )
    .await
    .inspect_err(|_| counters::connections_total("rejected"))?;

    let Some(channel) = channel_cell.get().cloned() else {
        return Err(RelayError::Rejected("missing channel id"));
    };
    debug!(peer = %peer_addr, channel, "websocket upgraded");

    serve_session(ws_stream, channel, &state).await
}

/// Run a session from `Connecting` to `Closed` over an upgraded stream.
///
/// # Errors
///
/// Returns [`RelayError::Subscribe`] if the channel could not be subscribed
/// (the session never becomes active), or the transport error that ended an
/// active session.
pub async fn serve_session<S>(
    ws_stream: WebSocketStream<S>,
    channel: String,
    state: &RelayState,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (handle, endpoint) = SocketHandle::channel(state.config.outbox_capacity);
    let session = Arc::new(Session::new(channel, Arc::new(handle)));
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    if let Err(source) = state.subscriptions.acquire(session.channel()).await {
        counters::connections_total("subscribe_failed");
        warn!(
            session = %session.id(),
            channel = session.channel(),
            error = %source,
            "subscription failed, closing connection"
        );
        let close = CloseFrame {
            code: CloseCode::Error,
            reason: "subscription failed".into(),
        };
        let _ = ws_tx.send(Message::Close(Some(close))).await;
        return Err(RelayError::Subscribe {
            channel: session.channel().to_owned(),
            source,
        });
    }

    if !state.registry.register(Arc::clone(&session)) {
        counters::connections_total("rejected");
        debug!(session = %session.id(), channel = session.channel(), "relay shutting down, closing connection");
        state.subscriptions.release(session.channel()).await;
        let close = CloseFrame {
            code: CloseCode::Away,
            reason: "server shutting down".into(),
        };
        let _ = ws_tx.send(Message::Close(Some(close))).await;
        return Ok(());
    }
    counters::connections_total("accepted");
    gauges::inc_sessions_active();
    info!(session = %session.id(), channel = session.channel(), "session joined");

    let result = run_session(&mut ws_tx, &mut ws_rx, endpoint, &session, state).await;

    let removed = state.registry.remove(&session);
    state.subscriptions.release(session.channel()).await;
    gauges::dec_sessions_active();
    let _ = ws_tx.close().await;
    info!(
        session = %session.id(),
        channel = session.channel(),
        removed,
        "session left"
    );

    result
}

/// Select over client input, queued deliveries, relay-initiated close and
/// keepalive until one of them ends the session.
async fn run_session<S>(
    ws_tx: &mut WsSink<S>,
    ws_rx: &mut WsRecv<S>,
    endpoint: SocketEndpoint,
    session: &Session,
    state: &RelayState,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let SocketEndpoint {
        mut outbox,
        mut closed,
    } = endpoint;
    let mut limiter = PublishLimiter::new(state.config.msg_rate, state.config.bw_rate);
    let ping_period = Duration::from_secs(state.config.ping_interval);
    let mut ping_interval = interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        relay_inbound(text.as_bytes(), session, state, &mut limiter).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        relay_inbound(&data, session, state, &mut limiter).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log_close(session, frame.as_ref());
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    None => {
                        debug!(session = %session.id(), "client stream ended");
                        return Ok(());
                    }
                }
            }
            Some(content) = outbox.recv() => {
                last_activity = Instant::now();
                let text = Delivery { content: &content }.encode();
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    debug!(session = %session.id(), error = %e, "delivery write failed");
                    return Err(RelayError::WebSocket(e));
                }
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    debug!(session = %session.id(), "session closed by relay");
                    return Ok(());
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(session = %session.id(), "idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    debug!(session = %session.id(), error = %e, "failed to send ping");
                }
            }
        }
    }
}

/// Publish one client frame. Nothing here ends the session.
async fn relay_inbound(
    data: &[u8],
    session: &Session,
    state: &RelayState,
    limiter: &mut PublishLimiter,
) {
    let message = match ClientMessage::decode(data) {
        Ok(message) => message,
        Err(e) => {
            counters::messages_dropped_total("malformed");
            debug!(session = %session.id(), error = %e, "dropping undecodable client message");
            return;
        }
    };

    if state.config.own_channel_only && message.id != session.channel() {
        counters::messages_dropped_total("foreign_channel");
        debug!(
            session = %session.id(),
            channel = session.channel(),
            target = %message.id,
            "dropping publish outside own channel"
        );
        return;
    }

    if let Err(limited) = limiter.check(message.content.len()) {
        counters::messages_dropped_total(limited.as_str());
        debug!(session = %session.id(), reason = limited.as_str(), "publish rate limited");
        return;
    }

    match state.broker.publish(&message.id, &message.content).await {
        Ok(()) => {
            counters::messages_published_total();
            debug!(session = %session.id(), channel = %message.id, "published client message");
        }
        Err(e) => {
            counters::publish_failures_total();
            warn!(
                session = %session.id(),
                channel = %message.id,
                error = %e,
                "publish failed, message dropped"
            );
        }
    }
}
