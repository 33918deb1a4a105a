//! Filter to subscription mapping.
//!
//! The dispatcher reads a snapshot per inbound message, so registering or
//! unregistering while a dispatch is in progress never affects that
//! dispatch.

use crate::envelope::Envelope;
use crate::topic;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifies one registration. Returned by subscribe, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered handler. The envelope queue feeds its worker.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filter: String,
    /// Module that registered it
    pub owner: String,
    pub queue: mpsc::UnboundedSender<Envelope>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns true when it is the first one for its
    /// filter, meaning the broker needs to hear about the filter.
    pub async fn insert(&self, subscription: Subscription) -> bool {
        let mut entries = self.entries.write().await;
        let slot = entries.entry(subscription.filter.clone()).or_default();
        slot.push(subscription);
        slot.len() == 1
    }

    /// Remove a subscription. `None` if it was not registered, otherwise
    /// whether its filter now has no subscriptions left.
    pub async fn remove(&self, filter: &str, id: SubscriptionId) -> Option<bool> {
        let mut entries = self.entries.write().await;
        let slot = entries.get_mut(filter)?;
        let position = slot.iter().position(|s| s.id == id)?;
        slot.remove(position);

        if slot.is_empty() {
            entries.remove(filter);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Snapshot of every subscription whose filter matches `topic`.
    pub async fn matching(&self, topic: &str) -> Vec<Subscription> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(filter, _)| topic::matches(topic, filter))
            .flat_map(|(_, subs)| subs.iter().cloned())
            .collect()
    }

    /// Distinct filters, sorted.
    pub async fn filters(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut filters: Vec<String> = entries.keys().cloned().collect();
        filters.sort();
        filters
    }

    /// Total number of subscriptions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop everything, closing every worker queue.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
