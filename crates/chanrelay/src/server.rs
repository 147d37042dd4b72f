use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::metrics::{counters, HealthState};
use crate::outbound::{run_outbound, Subscriptions};
use crate::registry::Registry;
use dashmap::DashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for connection tasks after closing every session.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the relay server.
pub struct RelayState {
    /// Channel → sessions table.
    pub registry: Registry,
    /// Subscription reference counts on the shared broker subscriber.
    pub subscriptions: Subscriptions,
    /// Broker client messages are published to.
    pub broker: Arc<dyn Broker>,
    /// Runtime server configuration.
    pub config: RelayConfig,
    /// Readiness reported on `/ready`.
    pub health: HealthState,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Connections currently holding an admission slot.
    pub active_connections: AtomicUsize,
}

impl RelayState {
    /// Build state around a resolved broker.
    pub fn new(config: RelayConfig, broker: Arc<dyn Broker>, health: HealthState) -> Self {
        Self {
            registry: Registry::new(),
            subscriptions: Subscriptions::new(Arc::clone(&broker)),
            broker,
            config,
            health,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// Run the relay until the process is killed.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<RelayState>) -> Result<(), RelayError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Run the accept loop and the outbound relay until `shutdown` resolves.
///
/// On shutdown every session is closed, in-flight connection tasks are given
/// [`DRAIN_TIMEOUT`] to finish, and the broker subscriber is closed.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send,
{
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("relay listening on {}", local_addr);

    let initial = match state.subscriptions.reconnect().await {
        Ok(subscriber) => Some(subscriber),
        Err(e) => {
            warn!(error = %e, "broker subscriber unavailable at startup");
            None
        }
    };
    let outbound = tokio::spawn(run_outbound(Arc::clone(&state), initial));

    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            counters::connections_total("rejected");
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                info!("shutdown signal received, draining {} connections", connections.len());
                break;
            }
        }
    }

    let closed = state.registry.drain();
    debug!(closed, "closed all sessions");

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            connections.len()
        );
        connections.abort_all();
    }

    outbound.abort();
    state.subscriptions.close().await;
    info!("relay shut down gracefully");
    Ok(())
}
