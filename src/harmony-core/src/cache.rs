//! In-memory result cache with expiry and a bounded size.
//!
//! Entries are keyed by the arguments of the call that produced them and
//! store the insertion instant next to the value. Expired entries are dropped
//! on lookup; once the cache is full the oldest entry is evicted.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// `None` keeps entries until evicted for space.
    ttl: Option<Duration>,
    /// Maximum number of entries (0 = no limit)
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Option<Duration>, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity,
        }
    }

    /// Look up a live entry, invalidating it if it has expired.
    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn invalidate(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_at(&mut self, key: &K, now: Instant) -> Option<V> {
        let entry = self.entries.get(key)?;
        if self.is_expired(entry, now) {
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn insert_at(&mut self, key: K, value: V, now: Instant) {
        if self.ttl.is_some() {
            let ttl = self.ttl;
            self.entries
                .retain(|_, entry| !expired(ttl, entry.inserted_at, now));
        }

        if self.capacity > 0
            && self.entries.len() >= self.capacity
            && !self.entries.contains_key(&key)
        {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                tracing::debug!(capacity = self.capacity, "evicted oldest cache entry");
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        expired(self.ttl, entry.inserted_at, now)
    }
}

fn expired(ttl: Option<Duration>, inserted_at: Instant, now: Instant) -> bool {
    match ttl {
        Some(ttl) => now.saturating_duration_since(inserted_at) > ttl,
        None => false,
    }
}
