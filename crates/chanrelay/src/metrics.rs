use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Readiness flag. Cleared while the broker subscriber is being rebuilt.
#[derive(Clone, Debug)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that starts ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve `/metrics`, `/health` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or the listener
/// cannot be bound.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "broker unavailable",
                ready: false,
            }),
        )
    }
}

/// Session gauges.
pub mod gauges {
    /// A session became active.
    pub fn inc_sessions_active() {
        metrics::gauge!("chanrelay_sessions_active").increment(1.0);
    }

    /// A session closed.
    pub fn dec_sessions_active() {
        metrics::gauge!("chanrelay_sessions_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a connection attempt outcome (`accepted`, `rejected`, `subscribe_failed`).
    pub fn connections_total(status: &'static str) {
        metrics::counter!("chanrelay_connections_total", "status" => status).increment(1);
    }

    /// A client message was published to the broker.
    pub fn messages_published_total() {
        metrics::counter!("chanrelay_messages_published_total").increment(1);
    }

    /// The broker rejected a publish.
    pub fn publish_failures_total() {
        metrics::counter!("chanrelay_publish_failures_total").increment(1);
    }

    /// A message was dropped; `reason` says why.
    pub fn messages_dropped_total(reason: &'static str) {
        messages_dropped_by(reason, 1);
    }

    /// `n` messages were dropped for the same `reason`.
    pub fn messages_dropped_by(reason: &'static str, n: u64) {
        metrics::counter!("chanrelay_messages_dropped_total", "reason" => reason).increment(n);
    }

    /// Broker content handed to sessions.
    pub fn deliveries_total(n: u64) {
        metrics::counter!("chanrelay_deliveries_total").increment(n);
    }

    /// The shared broker subscriber was lost.
    pub fn broker_disconnects_total() {
        metrics::counter!("chanrelay_broker_disconnects_total").increment(1);
    }
}

/// Distributions.
pub mod histograms {
    /// Number of sessions one broker event was fanned out to.
    pub fn fanout_sessions(n: usize) {
        metrics::histogram!("chanrelay_fanout_sessions").record(n as f64);
    }
}
