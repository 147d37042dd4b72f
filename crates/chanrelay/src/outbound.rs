//! Broker → sessions direction: the shared subscriber and its fan-out loop.

use crate::backoff::Backoff;
use crate::broker::{Broker, BrokerEvent, Subscriber};
use crate::error::BrokerError;
use crate::metrics::{counters, histograms};
use crate::registry::FanOut;
use crate::server::RelayState;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct SubscriptionTable {
    subscriber: Option<Arc<dyn Subscriber>>,
    refs: HashMap<String, usize>,
}

/// Per-channel subscription reference counts on the shared subscriber.
///
/// The lock is held across broker calls so that subscribe, unsubscribe and
/// reconnect never interleave for the same channel.
pub struct Subscriptions {
    broker: Arc<dyn Broker>,
    table: tokio::sync::Mutex<SubscriptionTable>,
}

impl Subscriptions {
    /// Track subscriptions made through `broker`. No subscriber is open yet.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            table: tokio::sync::Mutex::new(SubscriptionTable {
                subscriber: None,
                refs: HashMap::new(),
            }),
        }
    }

    /// Make sure `channel` is subscribed on behalf of one more session.
    ///
    /// # Errors
    ///
    /// Fails if no subscriber is connected or the broker rejects the channel;
    /// the reference is not taken in that case.
    pub async fn acquire(&self, channel: &str) -> Result<(), BrokerError> {
        let mut table = self.table.lock().await;
        let subscriber = table
            .subscriber
            .clone()
            .ok_or_else(|| BrokerError::Disconnected("subscriber not connected".to_string()))?;
        subscriber.subscribe(channel).await?;
        *table.refs.entry(channel.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one session's reference; unsubscribes when the last one goes.
    pub async fn release(&self, channel: &str) {
        let mut table = self.table.lock().await;
        let Some(refs) = table.refs.get_mut(channel) else {
            return;
        };
        *refs -= 1;
        if *refs > 0 {
            return;
        }
        table.refs.remove(channel);
        if let Some(subscriber) = table.subscriber.clone() {
            if let Err(e) = subscriber.unsubscribe(channel).await {
                debug!(channel, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Replace the subscriber with a fresh connection and subscribe every
    /// channel that still has sessions.
    ///
    /// # Errors
    ///
    /// Returns the broker error if connecting or any resubscription fails;
    /// the table is then left without a subscriber.
    pub async fn reconnect(&self) -> Result<Arc<dyn Subscriber>, BrokerError> {
        let mut table = self.table.lock().await;
        if let Some(old) = table.subscriber.take() {
            old.close().await;
        }
        let subscriber = self.broker.connect().await?;
        for channel in table.refs.keys() {
            if let Err(e) = subscriber.subscribe(channel).await {
                subscriber.close().await;
                return Err(e);
            }
        }
        table.subscriber = Some(Arc::clone(&subscriber));
        Ok(subscriber)
    }

    /// Close the subscriber, if any.
    pub async fn close(&self) {
        let subscriber = self.table.lock().await.subscriber.take();
        if let Some(subscriber) = subscriber {
            subscriber.close().await;
        }
    }

    /// Sessions currently holding `channel`.
    pub async fn refs(&self, channel: &str) -> usize {
        self.table.lock().await.refs.get(channel).copied().unwrap_or(0)
    }

    /// Number of channels with at least one reference.
    pub async fn channel_count(&self) -> usize {
        self.table.lock().await.refs.len()
    }
}

impl fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions").finish_non_exhaustive()
    }
}

/// Keep trying to open a subscriber, sleeping with backoff between attempts.
async fn reconnect_until_ready(state: &RelayState, backoff: &mut Backoff) -> Arc<dyn Subscriber> {
    loop {
        match state.subscriptions.reconnect().await {
            Ok(subscriber) => {
                backoff.reset();
                state.health.set_ready(true);
                let channels = state.subscriptions.channel_count().await;
                info!(channels, "broker subscriber connected");
                return subscriber;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "broker subscriber unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn record_fan_out(channel: &str, report: FanOut) {
    histograms::fanout_sessions(report.delivered);
    counters::deliveries_total(report.delivered as u64);
    if report.dropped > 0 {
        counters::messages_dropped_by("outbox_full", report.dropped as u64);
    }
    if report.removed > 0 {
        debug!(channel, removed = report.removed, "pruned closed sessions during fan-out");
    }
}

/// Receive broker events forever and fan content out to local sessions.
///
/// `initial` is the subscriber opened at startup, if that succeeded. A
/// connection error marks the relay not-ready and rebuilds the subscriber;
/// delivery resumes once it is back.
pub async fn run_outbound(state: Arc<RelayState>, initial: Option<Arc<dyn Subscriber>>) {
    let mut backoff = Backoff::new(state.config.reconnect_initial(), state.config.reconnect_max());
    let mut subscriber = match initial {
        Some(subscriber) => subscriber,
        None => {
            state.health.set_ready(false);
            reconnect_until_ready(&state, &mut backoff).await
        }
    };

    loop {
        match subscriber.receive().await {
            BrokerEvent::Content { channel, content } => {
                let report = state.registry.fan_out(&channel, &content);
                record_fan_out(&channel, report);
            }
            BrokerEvent::SubscriptionAck {
                channel,
                kind,
                count,
            } => {
                debug!(channel, kind = kind.as_str(), count, "subscription message");
            }
            BrokerEvent::ConnectionError { cause } => {
                error!(error = %cause, "broker subscriber lost, delivery paused");
                counters::broker_disconnects_total();
                state.health.set_ready(false);
                subscriber = reconnect_until_ready(&state, &mut backoff).await;
            }
        }
    }
}
