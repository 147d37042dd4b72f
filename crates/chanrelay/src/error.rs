use thiserror::Error;

/// Errors that end a single client connection.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The broker refused or could not set up the channel subscription.
    #[error("subscription to channel {channel:?} failed: {source}")]
    Subscribe {
        /// Channel the session tried to join.
        channel: String,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },
    /// The connection was turned away before the upgrade.
    #[error("connection rejected: {0}")]
    Rejected(&'static str),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`Broker`](crate::broker::Broker) or its subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker connection is gone.
    #[error("broker connection lost: {0}")]
    Disconnected(String),
    /// The broker rejected a subscribe or unsubscribe request.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),
    /// The broker rejected a publish.
    #[error("publish failed: {0}")]
    Publish(String),
    /// The configured broker address could not be parsed.
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
}

/// Why a message could not be queued for a session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The session's outbox is full; the message is dropped.
    #[error("outbox full")]
    Full,
    /// The session's writer has gone away.
    #[error("transport closed")]
    Closed,
}
