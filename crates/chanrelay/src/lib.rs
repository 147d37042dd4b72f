//! Channel relay: browser WebSocket sessions ↔ publish/subscribe broker.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
/// Broker capability and the in-process broker.
pub mod broker;
/// CLI argument parsing and relay configuration.
pub mod config;
/// Per-connection admission, upgrade and session lifecycle.
pub mod connection;
/// Error types for relay operations.
pub mod error;
/// Wire shapes exchanged with clients.
pub mod message;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Shared broker subscriber and outbound fan-out loop.
pub mod outbound;
mod ratelimit;
/// Broker backed by Redis publish/subscribe.
pub mod redis_broker;
/// Channel → sessions table.
pub mod registry;
/// Accept loop and shared relay state.
pub mod server;
/// Sessions and their transport handles.
pub mod session;

pub use broker::{Broker, BrokerEvent, MemoryBroker, Subscriber};
pub use redis_broker::RedisBroker;
pub use registry::Registry;
pub use server::{run, run_with_shutdown, RelayState};
pub use session::{Session, SessionId, Transport};
