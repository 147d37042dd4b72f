//! Publish/subscribe broker capability and an in-process implementation.

use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

/// Capacity of the in-process bus. Subscribers that fall further behind skip
/// messages (`RecvError::Lagged`).
const BUS_CAPACITY: usize = 4096;

/// Whether a [`BrokerEvent::SubscriptionAck`] confirms a join or a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// The channel was subscribed.
    Subscribe,
    /// The channel was unsubscribed.
    Unsubscribe,
}

impl AckKind {
    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Something received on a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A message published on a subscribed channel.
    Content {
        /// Channel the message was published on.
        channel: String,
        /// Message body.
        content: String,
    },
    /// Confirmation of a subscribe or unsubscribe request.
    SubscriptionAck {
        /// Channel concerned.
        channel: String,
        /// Join or leave.
        kind: AckKind,
        /// Channels still subscribed on this connection.
        count: usize,
    },
    /// The subscriber connection is unusable; no further events will follow.
    ConnectionError {
        /// What went wrong.
        cause: BrokerError,
    },
}

/// A broker the relay publishes to and opens subscriber connections on.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `content` on `channel`.
    async fn publish(&self, channel: &str, content: &str) -> Result<(), BrokerError>;

    /// Open a new subscriber connection with no channels subscribed.
    async fn connect(&self) -> Result<Arc<dyn Subscriber>, BrokerError>;
}

/// One subscriber connection. All methods take `&self` and may be called
/// concurrently: `receive` runs in one task while others subscribe.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `channel`. Subscribing twice is not an error.
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Unsubscribe from `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Wait for the next event.
    async fn receive(&self) -> BrokerEvent;

    /// Close the connection. A pending `receive` returns a connection error.
    async fn close(&self);
}

#[derive(Debug)]
struct Published {
    channel: String,
    content: String,
}

#[derive(Debug)]
struct MemoryInner {
    bus: broadcast::Sender<Arc<Published>>,
    generation: watch::Sender<u64>,
    reject_subscriptions: AtomicBool,
    reject_publishes: AtomicBool,
    published: AtomicU64,
    connects: AtomicU64,
}

/// Broker living inside the relay process, backed by `tokio::sync::broadcast`.
///
/// Useful for single-node deployments and for tests; `sever` and the
/// `reject_*` switches inject failures.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(MemoryInner {
                bus,
                generation,
                reject_subscriptions: AtomicBool::new(false),
                reject_publishes: AtomicBool::new(false),
                published: AtomicU64::new(0),
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Break every subscriber connection opened so far. New connections work.
    pub fn sever(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Make subsequent subscribe requests fail.
    pub fn reject_subscriptions(&self, reject: bool) {
        self.inner.reject_subscriptions.store(reject, Ordering::SeqCst);
    }

    /// Make subsequent publishes fail.
    pub fn reject_publishes(&self, reject: bool) {
        self.inner.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Number of successful publishes.
    #[must_use]
    pub fn published_total(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of subscriber connections opened.
    #[must_use]
    pub fn connects_total(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, content: &str) -> Result<(), BrokerError> {
        if self.inner.reject_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("publishing disabled".to_string()));
        }
        // No receivers just means nobody is subscribed yet.
        let _ = self.inner.bus.send(Arc::new(Published {
            channel: channel.to_owned(),
            content: content.to_owned(),
        }));
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self) -> Result<Arc<dyn Subscriber>, BrokerError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let severed = self.inner.generation.subscribe();
        let generation = *severed.borrow();
        Ok(Arc::new(MemorySubscriber {
            broker: Arc::clone(&self.inner),
            generation,
            channels: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            acks_tx,
            streams: tokio::sync::Mutex::new(Streams {
                bus: self.inner.bus.subscribe(),
                acks: acks_rx,
                severed,
            }),
        }))
    }
}

struct Streams {
    bus: broadcast::Receiver<Arc<Published>>,
    acks: mpsc::UnboundedReceiver<BrokerEvent>,
    severed: watch::Receiver<u64>,
}

struct MemorySubscriber {
    broker: Arc<MemoryInner>,
    generation: u64,
    channels: Mutex<HashSet<String>>,
    closed: AtomicBool,
    acks_tx: mpsc::UnboundedSender<BrokerEvent>,
    streams: tokio::sync::Mutex<Streams>,
}

impl MemorySubscriber {
    fn check_alive(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("subscriber closed".to_string()));
        }
        if *self.broker.generation.borrow() != self.generation {
            return Err(BrokerError::Disconnected("connection severed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.check_alive()?;
        if self.broker.reject_subscriptions.load(Ordering::SeqCst) {
            return Err(BrokerError::SubscriptionRejected(channel.to_owned()));
        }
        let count = {
            let mut channels = self.channels.lock();
            channels.insert(channel.to_owned());
            channels.len()
        };
        let _ = self.acks_tx.send(BrokerEvent::SubscriptionAck {
            channel: channel.to_owned(),
            kind: AckKind::Subscribe,
            count,
        });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.check_alive()?;
        let count = {
            let mut channels = self.channels.lock();
            channels.remove(channel);
            channels.len()
        };
        let _ = self.acks_tx.send(BrokerEvent::SubscriptionAck {
            channel: channel.to_owned(),
            kind: AckKind::Unsubscribe,
            count,
        });
        Ok(())
    }

    async fn receive(&self) -> BrokerEvent {
        let mut streams = self.streams.lock().await;
        let Streams {
            bus,
            acks,
            severed,
        } = &mut *streams;
        loop {
            if let Err(cause) = self.check_alive() {
                return BrokerEvent::ConnectionError { cause };
            }
            tokio::select! {
                biased;
                changed = severed.changed() => {
                    if changed.is_err() {
                        return BrokerEvent::ConnectionError {
                            cause: BrokerError::Disconnected("broker dropped".to_string()),
                        };
                    }
                }
                Some(event) = acks.recv() => {
                    if let BrokerEvent::ConnectionError { .. } = event {
                        return event;
                    }
                    if self.check_alive().is_ok() {
                        return event;
                    }
                }
                received = bus.recv() => match received {
                    Ok(published) => {
                        if self.channels.lock().contains(&published.channel) {
                            return BrokerEvent::Content {
                                channel: published.channel.clone(),
                                content: published.content.clone(),
                            };
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory broker subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return BrokerEvent::ConnectionError {
                            cause: BrokerError::Disconnected("bus closed".to_string()),
                        };
                    }
                },
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.acks_tx.send(BrokerEvent::ConnectionError {
                cause: BrokerError::Disconnected("subscriber closed".to_string()),
            });
        }
    }
}
