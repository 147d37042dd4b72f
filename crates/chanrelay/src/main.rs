#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chanrelay::config::{Args, RelayConfig};
use chanrelay::metrics::{start_metrics_server, HealthState};
use chanrelay::{run_with_shutdown, Broker, MemoryBroker, RedisBroker, RelayState};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config: RelayConfig = Args::parse().into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let health_state = HealthState::new();
    let broker: Arc<dyn Broker> = match config.broker_url.as_deref() {
        Some(url) => {
            let broker = RedisBroker::open(url, config.broker_password.as_deref())
                .await
                .context("failed to connect to redis broker")?;
            info!("using redis broker");
            Arc::new(broker)
        }
        None => {
            info!("no broker url configured, using in-process broker");
            Arc::new(MemoryBroker::new())
        }
    };

    let state = Arc::new(RelayState::new(config.clone(), broker, health_state.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
        info!("received shutdown signal");
    };

    run_with_shutdown(listener, state, shutdown).await?;
    Ok(())
}
