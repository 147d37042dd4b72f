use crate::error::DeliveryError;
use crate::session::{Session, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of one [`Registry::fan_out`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Sessions that accepted the content.
    pub delivered: usize,
    /// Sessions whose outbox was full; the content was dropped for them.
    pub dropped: usize,
    /// Sessions whose transport had gone away and were removed.
    pub removed: usize,
}

#[derive(Debug, Default)]
struct Inner {
    channels: HashMap<String, Vec<Arc<Session>>>,
    count: usize,
    draining: bool,
}

impl Inner {
    /// Remove `expected`, preferring `position` but falling back to a scan
    /// when the sequence has shifted. Returns the index now holding the
    /// session that followed `expected`, and the removed session if any.
    fn remove_at(
        &mut self,
        channel: &str,
        position: usize,
        expected: SessionId,
    ) -> (usize, Option<Arc<Session>>) {
        let Some(seq) = self.channels.get_mut(channel) else {
            return (position, None);
        };
        let index = if seq.get(position).is_some_and(|s| s.id() == expected) {
            Some(position)
        } else {
            seq.iter().position(|s| s.id() == expected)
        };
        let Some(index) = index else {
            return (position, None);
        };

        let removed = seq.remove(index);
        if seq.is_empty() {
            self.channels.remove(channel);
        }
        self.count -= 1;
        (index, Some(removed))
    }
}

/// Concurrent channel → sessions table.
///
/// Every read and write goes through one lock. Transports are only closed
/// after the lock is released, and only by the call that removed the session.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a session under its own channel.
    pub fn add(&self, session: Arc<Session>) {
        let mut inner = self.inner.lock();
        inner
            .channels
            .entry(session.channel().to_owned())
            .or_default()
            .push(session);
        inner.count += 1;
    }

    /// Append a session unless the registry has been drained.
    ///
    /// Returns `false` after [`Registry::drain`], leaving the session out and
    /// its transport untouched.
    pub fn register(&self, session: Arc<Session>) -> bool {
        let mut inner = self.inner.lock();
        if inner.draining {
            return false;
        }
        inner
            .channels
            .entry(session.channel().to_owned())
            .or_default()
            .push(session);
        inner.count += 1;
        true
    }

    /// Whether [`Registry::drain`] has run.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    /// Remove a session by identity and close its transport.
    ///
    /// Returns `false` if the session was already gone, in which case nothing
    /// else happens. Exactly one caller ever sees `true` for a given session.
    pub fn remove(&self, session: &Session) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            inner.remove_at(session.channel(), 0, session.id()).1
        };
        match removed {
            Some(session) => {
                session.transport().close();
                true
            }
            None => false,
        }
    }

    /// Remove `expected` from `channel`, which the caller last saw at
    /// `position`, and close its transport.
    ///
    /// The identity is re-checked before anything is removed. Returns the
    /// cursor to resume iteration from: the index of the session that slid
    /// into the vacated slot.
    pub fn remove_at(&self, channel: &str, position: usize, expected: SessionId) -> usize {
        let (next, removed) = {
            let mut inner = self.inner.lock();
            inner.remove_at(channel, position, expected)
        };
        if let Some(session) = removed {
            session.transport().close();
        }
        next
    }

    /// Deliver `content` to every session registered under `channel`.
    ///
    /// Sessions whose transport has closed are removed in the same pass and
    /// the remaining ones are still delivered to.
    pub fn fan_out(&self, channel: &str, content: &str) -> FanOut {
        let mut report = FanOut::default();
        let mut failed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut cursor = 0;
            loop {
                let Some(session) = inner
                    .channels
                    .get(channel)
                    .and_then(|seq| seq.get(cursor))
                    .cloned()
                else {
                    break;
                };
                if session.channel() != channel {
                    cursor += 1;
                    continue;
                }
                match session.transport().try_deliver(content) {
                    Ok(()) => {
                        report.delivered += 1;
                        cursor += 1;
                    }
                    Err(DeliveryError::Full) => {
                        report.dropped += 1;
                        cursor += 1;
                    }
                    Err(DeliveryError::Closed) => {
                        let (next, removed) = inner.remove_at(channel, cursor, session.id());
                        cursor = next;
                        failed.extend(removed);
                    }
                }
            }
        }

        report.removed = failed.len();
        for session in failed {
            tracing::debug!(session = %session.id(), channel, "removed session after failed delivery");
            session.transport().close();
        }
        report
    }

    /// Remove every session, closing each transport once. Later
    /// [`Registry::register`] calls are refused.
    pub fn drain(&self) -> usize {
        let channels = {
            let mut inner = self.inner.lock();
            inner.draining = true;
            inner.count = 0;
            std::mem::take(&mut inner.channels)
        };
        let mut closed = 0;
        for session in channels.into_values().flatten() {
            session.transport().close();
            closed += 1;
        }
        closed
    }

    /// Total number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Returns `true` if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of sessions registered under `channel`.
    #[must_use]
    pub fn channel_len(&self, channel: &str) -> usize {
        self.inner.lock().channels.get(channel).map_or(0, Vec::len)
    }

    /// Channels that currently have at least one session.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.inner.lock().channels.keys().cloned().collect()
    }

    /// Session identities under `channel`, in delivery order.
    #[must_use]
    pub fn session_ids(&self, channel: &str) -> Vec<SessionId> {
        self.inner
            .lock()
            .channels
            .get(channel)
            .map(|seq| seq.iter().map(|s| s.id()).collect())
            .unwrap_or_default()
    }
}
