//! Replicated value store
//!
//! Local TTL map backing STORE and FIND_VALUE. Reads only observe entries
//! younger than their TTL; a periodic sweep discards the rest.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use veilnet_core::NodeId;

/// Default entry lifetime (1 hour)
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct StorageEntry {
    value: Value,
    inserted: Instant,
    ttl: Duration,
}

impl StorageEntry {
    fn is_fresh(&self) -> bool {
        self.inserted.elapsed() < self.ttl
    }
}

pub struct ValueStore {
    entries: HashMap<NodeId, StorageEntry>,
    default_ttl: Duration,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    /// Insert or overwrite with the default TTL
    pub fn insert(&mut self, key: NodeId, value: Value) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&mut self, key: NodeId, value: Value, ttl: Duration) {
        self.entries.insert(
            key,
            StorageEntry {
                value,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    /// The stored value, if its entry has not outlived its TTL
    pub fn get(&self, key: &NodeId) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh())
            .map(|entry| entry.value.clone())
    }

    /// Drop every expired entry
    pub fn evict_expired(&mut self) {
        self.entries.retain(|_, entry| entry.is_fresh());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}
