//! Topics the node must stay subscribed to across reconnects
//!
//! In-memory only: the set is rebuilt on every boot from the subscribe calls
//! the application makes. Only an explicit [`SubscriptionRegistry::remove`]
//! drops an entry.

use std::collections::BTreeSet;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: RwLock<BTreeSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the topic was already registered
    pub fn add(&self, topic: &str) -> bool {
        match self.topics.write() {
            Ok(mut topics) => topics.insert(topic.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(topic.to_string()),
        }
    }

    pub fn remove(&self, topic: &str) -> bool {
        match self.topics.write() {
            Ok(mut topics) => topics.remove(topic),
            Err(poisoned) => poisoned.into_inner().remove(topic),
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        match self.topics.read() {
            Ok(topics) => topics.contains(topic),
            Err(poisoned) => poisoned.into_inner().contains(topic),
        }
    }

    /// Snapshot of every registered topic, in sorted order
    pub fn all(&self) -> Vec<String> {
        match self.topics.read() {
            Ok(topics) => topics.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
