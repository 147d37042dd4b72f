use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "chanrelay")]
#[command(about = "WebSocket to pub/sub channel relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "CHANRELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "CHANRELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "CHANRELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "64", env = "CHANRELAY_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum published messages per minute per session.
    #[arg(long, default_value = "600", env = "CHANRELAY_MSG_RATE")]
    pub msg_rate: u32,
    /// Maximum published bytes per minute per session.
    #[arg(long, default_value = "1048576", env = "CHANRELAY_BW_RATE")]
    pub bw_rate: u64,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "CHANRELAY_MAX_MESSAGE")]
    pub max_message: usize,
    /// Messages buffered per session before deliveries are dropped.
    #[arg(long, default_value = "256", env = "CHANRELAY_OUTBOX_CAPACITY")]
    pub outbox_capacity: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "CHANRELAY_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "CHANRELAY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Only let a session publish to the channel it registered under.
    #[arg(long, env = "CHANRELAY_OWN_CHANNEL_ONLY")]
    pub own_channel_only: bool,
    /// First broker reconnect delay in milliseconds.
    #[arg(long, default_value = "100", env = "CHANRELAY_RECONNECT_INITIAL_MS")]
    pub reconnect_initial_ms: u64,
    /// Upper bound on the broker reconnect delay in milliseconds.
    #[arg(long, default_value = "10000", env = "CHANRELAY_RECONNECT_MAX_MS")]
    pub reconnect_max_ms: u64,
    /// Redis server as `redis://host:port/db` or `host:port`. Without it the
    /// relay runs on an in-process broker.
    #[arg(long, env = "CHANRELAY_BROKER_URL")]
    pub broker_url: Option<String>,
    /// Password for the Redis server.
    #[arg(long, env = "CHANRELAY_BROKER_PASSWORD", hide_env_values = true)]
    pub broker_password: Option<String>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum published messages per minute per session.
    pub msg_rate: u32,
    /// Maximum published bytes per minute per session.
    pub bw_rate: u64,
    /// Maximum WebSocket message size in bytes.
    pub max_message: usize,
    /// Messages buffered per session before deliveries are dropped.
    pub outbox_capacity: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Only let a session publish to the channel it registered under.
    pub own_channel_only: bool,
    /// First broker reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Upper bound on the broker reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,
    /// Redis server address; `None` selects the in-process broker.
    pub broker_url: Option<String>,
    /// Password for the Redis server.
    pub broker_password: Option<String>,
}

impl RelayConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 1_000_000 {
            return Err("msg_rate exceeds reasonable limit (1,000,000 msg/min)".to_string());
        }

        if self.bw_rate == 0 {
            return Err("bw_rate must be greater than 0".to_string());
        }
        if self.bw_rate > 100_000_000_000 {
            return Err("bw_rate exceeds reasonable limit (100 GB/min)".to_string());
        }

        const MAX_ALLOWED_MESSAGE: usize = 16 * 1024 * 1024;
        if self.max_message == 0 {
            return Err("max_message must be greater than 0".to_string());
        }
        if self.max_message > MAX_ALLOWED_MESSAGE {
            return Err(format!(
                "max_message exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_MESSAGE
            ));
        }

        if self.outbox_capacity == 0 {
            return Err("outbox_capacity must be greater than 0".to_string());
        }
        if self.outbox_capacity > 65_536 {
            return Err("outbox_capacity exceeds reasonable limit (65,536)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        // Idleness is only checked when a ping is due.
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout cannot be below ping_interval".to_string());
        }

        if self.reconnect_initial_ms == 0 {
            return Err("reconnect_initial_ms must be greater than 0".to_string());
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err("reconnect_max_ms cannot be below reconnect_initial_ms".to_string());
        }

        match &self.broker_url {
            Some(url) if url.trim().is_empty() => {
                return Err("broker_url cannot be empty".to_string());
            }
            None if self.broker_password.is_some() => {
                return Err("broker_password requires broker_url".to_string());
            }
            _ => {}
        }
        Ok(())
    }

    /// Initial delay before re-establishing a lost broker subscriber.
    #[must_use]
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    /// Ceiling for the broker reconnect delay.
    #[must_use]
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_conns: 100_000,
            max_conns_ip: 64,
            msg_rate: 600,
            bw_rate: 1_048_576,
            max_message: 65_536,
            outbox_capacity: 256,
            ping_interval: 30,
            idle_timeout: 120,
            own_channel_only: false,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 10_000,
            broker_url: None,
            broker_password: None,
        }
    }
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            msg_rate: args.msg_rate,
            bw_rate: args.bw_rate,
            max_message: args.max_message,
            outbox_capacity: args.outbox_capacity,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            own_channel_only: args.own_channel_only,
            reconnect_initial_ms: args.reconnect_initial_ms,
            reconnect_max_ms: args.reconnect_max_ms,
            broker_url: args.broker_url,
            broker_password: args.broker_password,
        }
    }
}
