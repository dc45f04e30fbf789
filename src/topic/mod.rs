//! Subscription registry
//!
//! Maps a (topic, requested QoS) pair to the ordered list of connections
//! subscribed at exactly that pair. Topics match by equality only and the
//! same connection may appear under several QoS keys for one topic; each
//! key is an independent entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::QoS;

/// Registry key: exact topic plus the QoS requested in SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub topic: Arc<str>,
    pub qos: QoS,
}

impl SubscriptionKey {
    pub fn new(topic: &str, qos: QoS) -> Self {
        Self {
            topic: Arc::from(topic),
            qos,
        }
    }
}

/// Thread-safe subscription registry
///
/// Entries are append-only: subscribing twice appends the handle twice.
/// Handles keep subscribe order so fan-out follows insertion order.
pub struct SubscriptionRegistry<H> {
    entries: RwLock<HashMap<SubscriptionKey, Vec<H>>>,
}

impl<H: Clone> SubscriptionRegistry<H> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of the handles subscribed at `(topic, qos)`, in subscribe
    /// order. Empty when nobody subscribed.
    pub fn lookup(&self, topic: &str, qos: QoS) -> Vec<H> {
        let entries = self.entries.read();
        entries
            .get(&SubscriptionKey::new(topic, qos))
            .cloned()
            .unwrap_or_default()
    }

    /// Append a handle to the entry at `(topic, qos)`, creating it if absent
    pub fn append(&self, topic: &str, qos: QoS, handle: H) {
        let mut entries = self.entries.write();
        entries
            .entry(SubscriptionKey::new(topic, qos))
            .or_default()
            .push(handle);
    }

    /// Drop every handle matching `predicate`; entries left empty are
    /// removed. Returns the number of handles removed.
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&H) -> bool,
    {
        let mut entries = self.entries.write();
        let mut removed = 0;
        entries.retain(|_, handles| {
            let before = handles.len();
            handles.retain(|h| !predicate(h));
            removed += before - handles.len();
            !handles.is_empty()
        });
        removed
    }

    /// Number of distinct (topic, QoS) keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total number of handles across all keys, duplicates included
    pub fn subscriber_count(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }
}

impl<H: Clone> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
