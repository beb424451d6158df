//! # Subscription Registry
//!
//! In-memory index of active subscriptions for fan-out lookup.
//!
//! Entries are keyed by `(channel, chaincode-or-*, event-or-*)`, so an event
//! needs exactly four hash lookups regardless of how many subscriptions exist:
//!
//! ```text
//! (channel, chaincode, event)
//! (channel, chaincode, *)
//! (channel, *,         event)
//! (channel, *,         *)
//! ```
//!
//! The store is the source of truth; the registry holds snapshots and is
//! rebuilt from the store at start. Reads take a shared lock; `register` and
//! `unregister` take the write lock only for the map update.
//!
//! Every mutation reports a [`ListenerDelta`] so the caller can move the
//! per-channel listener reference count in step.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{filters_match, CanonicalEvent, Subscription, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IndexKey {
    channel: String,
    chaincode: Option<String>,
    event: Option<String>,
}

impl IndexKey {
    fn of(subscription: &Subscription) -> Self {
        Self {
            channel: subscription.channel_name.clone(),
            chaincode: subscription.chaincode_name.clone(),
            event: subscription.event_name.clone(),
        }
    }

    fn lookups(event: &CanonicalEvent) -> [IndexKey; 4] {
        let key = |chaincode: Option<&str>, name: Option<&str>| IndexKey {
            channel: event.channel_name.clone(),
            chaincode: chaincode.map(str::to_string),
            event: name.map(str::to_string),
        };
        [
            key(Some(event.chaincode_name.as_str()), Some(event.event_name.as_str())),
            key(Some(event.chaincode_name.as_str()), None),
            key(None, Some(event.event_name.as_str())),
            key(None, None),
        ]
    }
}

/// Listener reference changes caused by one registry mutation.
///
/// Apply `acquire` before `release` so a re-registration on the same channel
/// never drops the count to zero in between.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenerDelta {
    pub acquire: Option<String>,
    pub release: Option<String>,
}

impl ListenerDelta {
    pub fn is_empty(&self) -> bool {
        self.acquire.is_none() && self.release.is_none()
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<SubscriptionId, IndexKey>,
    by_key: HashMap<IndexKey, HashMap<SubscriptionId, Arc<Subscription>>>,
}

impl Index {
    fn remove(&mut self, id: SubscriptionId) -> Option<IndexKey> {
        let key = self.by_id.remove(&id)?;
        if let Some(bucket) = self.by_key.get_mut(&key) {
            bucket.remove(&id);
            if bucket.is_empty() {
                self.by_key.remove(&key);
            }
        }
        Some(key)
    }
}

/// Live matching set
#[derive(Default)]
pub struct SubscriptionRegistry {
    index: RwLock<Index>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `subscription`. Inactive subscriptions
    /// are removed from the live set instead.
    pub fn register(&self, subscription: Subscription) -> ListenerDelta {
        let mut index = self.index.write();
        let previous = index.remove(subscription.id);

        let acquire = if subscription.active {
            let key = IndexKey::of(&subscription);
            let channel = key.channel.clone();
            index.by_id.insert(subscription.id, key.clone());
            index
                .by_key
                .entry(key)
                .or_default()
                .insert(subscription.id, Arc::new(subscription));
            Some(channel)
        } else {
            None
        };

        ListenerDelta {
            acquire,
            release: previous.map(|key| key.channel),
        }
    }

    /// Remove the entry for `id`, if any.
    pub fn unregister(&self, id: SubscriptionId) -> ListenerDelta {
        let previous = self.index.write().remove(id);
        ListenerDelta {
            acquire: None,
            release: previous.map(|key| key.channel),
        }
    }

    /// Every active subscription the event should be delivered to, oldest
    /// subscription first.
    pub fn matches(&self, event: &CanonicalEvent) -> Vec<Arc<Subscription>> {
        let index = self.index.read();
        let mut matched: Vec<Arc<Subscription>> = IndexKey::lookups(event)
            .iter()
            .filter_map(|key| index.by_key.get(key))
            .flat_map(|bucket| bucket.values())
            .filter(|sub| sub.active && filters_match(&sub.filters, &event.payload))
            .cloned()
            .collect();
        drop(index);

        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matched
    }

    /// Snapshot of the registered entry
    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let index = self.index.read();
        let key = index.by_id.get(&id)?;
        index.by_key.get(key)?.get(&id).cloned()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.read().by_id.contains_key(&id)
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live subscriptions per channel
    pub fn channel_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for key in self.index.read().by_id.values() {
            *counts.entry(key.channel.clone()).or_insert(0) += 1;
        }
        counts
    }
}
