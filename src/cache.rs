//! Get-or-populate cache with an explicit TTL.
//!
//! Owned by the component that needs it; there is no process-wide cache.

use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Concurrent map whose entries expire after `ttl`.
///
/// A zero TTL disables caching: every lookup populates afresh.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: DashMap<K, Entry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh cached value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        if self.ttl.is_zero() {
            return None;
        }
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Return the cached value or run `populate` and cache its `Ok` result.
    ///
    /// Errors are returned as-is and never cached. Concurrent misses may both
    /// populate; the later insert wins.
    pub async fn get_or_populate<F, Fut, E>(&self, key: K, populate: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = populate().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
