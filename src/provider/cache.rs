//! Small TTL cache for tracker responses.
//!
//! Entries past their TTL are not returned by [`TtlCache::fresh`] but stay
//! available through [`TtlCache::stale`], which is what the tracker falls back
//! to when the backend reports a rate limit.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    /// Last stored value regardless of age.
    pub fn stale(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().ok()?;
        entries.get(key).map(|(_, v)| v.clone())
    }

    pub fn put(&self, key: K, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, (Instant::now(), value));
        }
    }

    /// Mark every entry expired while keeping it for stale reads.
    pub fn expire_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            let past = Instant::now()
                .checked_sub(self.ttl)
                .unwrap_or_else(Instant::now);
            for (at, _) in entries.values_mut() {
                *at = past;
            }
        }
    }
}
