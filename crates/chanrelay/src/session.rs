use crate::error::DeliveryError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Process-unique session identity. Removal always goes through this, never
/// through channel name or transport equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identity.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw counter value, for logging.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Write side of a client connection as seen by the registry.
///
/// Both methods must return without waiting on the network: the registry
/// calls `try_deliver` while holding its lock.
pub trait Transport: Send + Sync {
    /// Queue `content` for the client.
    fn try_deliver(&self, content: &str) -> Result<(), DeliveryError>;

    /// Ask the connection to shut down. Called at most once per session.
    fn close(&self);
}

/// One registered client.
pub struct Session {
    id: SessionId,
    channel: String,
    transport: Arc<dyn Transport>,
}

impl Session {
    /// Create a session with a fresh identity.
    pub fn new(channel: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: SessionId::next(),
            channel: channel.into(),
            transport,
        }
    }

    /// Identity of this session.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Channel this session registered under.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// [`Transport`] backed by a connection task: deliveries go into a bounded
/// outbox, close flips a watch the task selects on.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    outbox: mpsc::Sender<String>,
    closed: watch::Sender<bool>,
}

/// Receiving half of a [`SocketHandle`], owned by the connection task.
#[derive(Debug)]
pub struct SocketEndpoint {
    /// Deliveries queued by the registry.
    pub outbox: mpsc::Receiver<String>,
    /// Becomes `true` once the session has been closed.
    pub closed: watch::Receiver<bool>,
}

impl SocketHandle {
    /// Create a handle and the endpoint the connection task drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, SocketEndpoint) {
        let (outbox_tx, outbox_rx) = mpsc::channel(capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Self {
                outbox: outbox_tx,
                closed: closed_tx,
            },
            SocketEndpoint {
                outbox: outbox_rx,
                closed: closed_rx,
            },
        )
    }
}

impl Transport for SocketHandle {
    fn try_deliver(&self, content: &str) -> Result<(), DeliveryError> {
        if *self.closed.borrow() {
            return Err(DeliveryError::Closed);
        }
        match self.outbox.try_send(content.to_owned()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}
