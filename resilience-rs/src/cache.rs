//! # Smart Cache
//!
//! In-memory key-value store with per-entry TTL. Expiry is lazy: an entry
//! is only checked, and evicted, when it is read. There is no capacity
//! bound and no background sweep.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tracing::trace;

/// A cache entry with expiration
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) > self.ttl
    }
}

#[derive(Debug)]
pub struct SmartCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone> SmartCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `value`, replacing any previous entry for `key`
    pub fn set<K: Into<String>>(&self, key: K, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.entries().insert(key.into(), entry);
    }

    /// Returns a live value, evicting it first if it has expired
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries();

        let expired = match entries.get(key) {
            Some(entry) => entry.is_expired(Instant::now()),
            None => {
                counter!("cache.misses", 1);
                return None;
            }
        };

        if expired {
            trace!(key = %key, "Evicting expired cache entry");
            entries.remove(key);
            counter!("cache.misses", 1);
            return None;
        }

        counter!("cache.hits", 1);
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries().remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Number of stored entries, expired ones included until read
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
