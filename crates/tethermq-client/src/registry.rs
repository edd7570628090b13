//! Subscription registry
//!
//! Holds the topic → handler map plus the two topic sets the controller keeps
//! consistent with the session:
//!
//! - **active**: topics believed subscribed on the current (or last) session
//! - **pending**: topics requested while no session existed
//!
//! The registry does no I/O and has no lock of its own. It lives inside the
//! manager's single state lock, so every method here runs atomically with
//! respect to state and session changes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tethermq_core::InboundMessage;

use crate::error::HandlerError;

/// Callback invoked on the owner context for each delivered message
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync>;

struct Entry {
    handler: MessageHandler,
    durable: bool,
}

/// What the caller must do after [`SubscriptionRegistry::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeAction {
    /// Send a subscribe request on the live session
    Send,
    /// Already subscribed on the live session; only the handler changed
    Replaced,
    /// No live session; the topic waits in the pending set
    Deferred,
}

/// Topic → handler map with active and pending sets
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
    active: BTreeSet<String>,
    pending: BTreeSet<String>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("handlers", &self.entries.len())
            .field("active", &self.active)
            .field("pending", &self.pending)
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handler for `topic`.
    ///
    /// A topic never has two handlers: a second call replaces the first.
    pub fn upsert(
        &mut self,
        topic: &str,
        handler: MessageHandler,
        durable: bool,
        connected: bool,
    ) -> SubscribeAction {
        self.entries
            .insert(topic.to_string(), Entry { handler, durable });

        if !connected {
            self.pending.insert(topic.to_string());
            return SubscribeAction::Deferred;
        }

        if self.active.insert(topic.to_string()) {
            SubscribeAction::Send
        } else {
            SubscribeAction::Replaced
        }
    }

    /// Forget `topic`. Returns `true` when an unsubscribe request must go to
    /// the live session.
    pub fn remove(&mut self, topic: &str, connected: bool) -> bool {
        self.entries.remove(topic);
        self.pending.remove(topic);
        let was_active = self.active.remove(topic);
        was_active && connected
    }

    /// Snapshot active + pending as one batch, promote pending to active and
    /// clear pending.
    ///
    /// Called once per installed session under the state lock, so a
    /// concurrent `subscribe` either lands in this batch or is sent on its own
    /// after the session is visible, never neither.
    pub fn take_resubscribe_batch(&mut self) -> Vec<String> {
        let pending = std::mem::take(&mut self.pending);
        self.active.extend(pending);
        self.active.iter().cloned().collect()
    }

    /// Drop non-durable entries after the session they belonged to is gone.
    pub fn discard_transient(&mut self) -> Vec<String> {
        let transient: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.durable)
            .map(|(topic, _)| topic.clone())
            .collect();

        for topic in &transient {
            self.entries.remove(topic);
            self.active.remove(topic);
            self.pending.remove(topic);
        }
        transient
    }

    /// Handler for a delivered topic: exact match first, then wildcard filters.
    pub fn resolve(&self, topic: &str) -> Option<MessageHandler> {
        if let Some(entry) = self.entries.get(topic) {
            return Some(Arc::clone(&entry.handler));
        }

        // Deterministic pick when several filters match
        let mut matching: Vec<(&String, &Entry)> = self
            .entries
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(b.0));
        matching
            .first()
            .map(|(_, entry)| Arc::clone(&entry.handler))
    }

    /// Topics in the active set, sorted
    pub fn active_topics(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }

    /// Topics waiting for the next session, sorted
    pub fn pending_topics(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Whether a handler is registered for exactly `topic`
    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// MQTT topic filter matching.
///
/// - `+` matches exactly one level
/// - `#` as the last level matches the parent and any number of levels below
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }
    if !filter.contains(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
