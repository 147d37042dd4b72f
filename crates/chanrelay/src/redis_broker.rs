//! Broker backed by the publish/subscribe commands of a Redis server.

use crate::broker::{AckKind, Broker, BrokerEvent, Subscriber};
use crate::error::BrokerError;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo, RedisError};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Resolve `address` (a `redis://` URL or a bare `host:port`) and apply
/// `password` on top of whatever the URL carries.
pub fn connection_info(address: &str, password: Option<&str>) -> Result<ConnectionInfo, BrokerError> {
    let url = if address.contains("://") {
        address.to_owned()
    } else {
        format!("redis://{address}")
    };
    let mut info = url
        .as_str()
        .into_connection_info()
        .map_err(|e| BrokerError::InvalidAddress(e.to_string()))?;
    if let Some(password) = password {
        info.redis.password = Some(password.to_owned());
    }
    Ok(info)
}

fn disconnected(e: RedisError) -> BrokerError {
    BrokerError::Disconnected(e.to_string())
}

/// Publishes through one shared connection and opens a dedicated pub/sub
/// connection per [`Broker::connect`].
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBroker {
    /// Connect the publishing side to the server at `address`.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be parsed or the server is unreachable.
    pub async fn open(address: &str, password: Option<&str>) -> Result<Self, BrokerError> {
        let info = connection_info(address, password)?;
        let client = redis::Client::open(info).map_err(disconnected)?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(disconnected)?;
        Ok(Self { client, publisher })
    }
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, content: &str) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn
            .publish(channel, content)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn connect(&self) -> Result<Arc<dyn Subscriber>, BrokerError> {
        let pubsub = self.client.get_async_pubsub().await.map_err(disconnected)?;
        let (sink, messages) = pubsub.split();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(RedisSubscriber {
            sink: tokio::sync::Mutex::new(sink),
            channels: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            acks_tx,
            streams: tokio::sync::Mutex::new(RedisStreams {
                messages,
                acks: acks_rx,
            }),
        }))
    }
}

struct RedisStreams {
    messages: PubSubStream,
    acks: mpsc::UnboundedReceiver<BrokerEvent>,
}

/// Redis answers subscribe and unsubscribe on the sink, so acknowledgements
/// are queued locally and interleaved with published messages in `receive`.
struct RedisSubscriber {
    sink: tokio::sync::Mutex<PubSubSink>,
    channels: Mutex<HashSet<String>>,
    closed: AtomicBool,
    acks_tx: mpsc::UnboundedSender<BrokerEvent>,
    streams: tokio::sync::Mutex<RedisStreams>,
}

impl RedisSubscriber {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("subscriber closed".to_string()));
        }
        Ok(())
    }

    fn ack(&self, channel: &str, kind: AckKind) {
        let count = {
            let mut channels = self.channels.lock();
            match kind {
                AckKind::Subscribe => channels.insert(channel.to_owned()),
                AckKind::Unsubscribe => channels.remove(channel),
            };
            channels.len()
        };
        let _ = self.acks_tx.send(BrokerEvent::SubscriptionAck {
            channel: channel.to_owned(),
            kind,
            count,
        });
    }
}

fn command_error(channel: &str, e: RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() {
        BrokerError::Disconnected(e.to_string())
    } else {
        BrokerError::SubscriptionRejected(format!("{channel}: {e}"))
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.sink
            .lock()
            .await
            .subscribe(channel)
            .await
            .map_err(|e| command_error(channel, e))?;
        self.ack(channel, AckKind::Subscribe);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.sink
            .lock()
            .await
            .unsubscribe(channel)
            .await
            .map_err(|e| command_error(channel, e))?;
        self.ack(channel, AckKind::Unsubscribe);
        Ok(())
    }

    async fn receive(&self) -> BrokerEvent {
        let mut streams = self.streams.lock().await;
        let RedisStreams { messages, acks } = &mut *streams;
        loop {
            if let Err(cause) = self.check_open() {
                return BrokerEvent::ConnectionError { cause };
            }
            tokio::select! {
                biased;
                Some(event) = acks.recv() => return event,
                msg = messages.next() => match msg {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(content) => {
                            return BrokerEvent::Content {
                                channel: msg.get_channel_name().to_owned(),
                                content,
                            };
                        }
                        Err(e) => {
                            warn!(channel = msg.get_channel_name(), error = %e, "dropping non-text broker payload");
                        }
                    },
                    None => {
                        return BrokerEvent::ConnectionError {
                            cause: BrokerError::Disconnected("redis pub/sub stream ended".to_string()),
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
