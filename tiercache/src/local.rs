//! L1: process-local region map

use crate::types::{CacheEntry, CacheKey};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A process-local level the invalidation handler can evict from
pub trait EvictionTarget: Send + Sync {
    /// Region this level holds
    fn region(&self) -> &str;

    /// Remove `key` if held; returns whether anything was removed
    fn evict_if_present(&self, key: &CacheKey) -> bool;

    /// Drop every entry; used when invalidations may have been missed
    fn clear(&self);
}

/// L1 cache: in-process region map
///
/// `put` clears the whole region before inserting, so after `put(k, v)` every
/// key other than `k` misses. Eviction is targeted.
#[derive(Clone)]
pub struct LocalCache<V> {
    region: Arc<str>,

    /// Region map, the only lock of this level
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry<V>>>>,

    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    clears: AtomicU64,
}

/// L1 statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    /// Entries discarded by clear-then-insert writes and explicit clears
    pub clears: u64,
    pub entries: usize,
}

impl<V: Clone> LocalCache<V> {
    /// Create an empty region
    pub fn new(region: impl Into<String>) -> Self {
        let region: String = region.into();
        Self {
            region: Arc::from(region),
            entries: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Look up an entry (present or absent marker)
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("L1 Cache HIT for key: {}", key);
                Some(entry.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("L1 Cache MISS for key: {}", key);
                None
            }
        }
    }

    /// Clear the region, then insert `value` under `key`
    pub fn put(&self, key: CacheKey, value: V) {
        self.put_entry(CacheEntry::present(key, value));
    }

    /// Clear the region, then insert the "no value" marker under `key`
    pub fn put_absent(&self, key: CacheKey) {
        self.put_entry(CacheEntry::absent(key));
    }

    pub(crate) fn put_entry(&self, entry: CacheEntry<V>) {
        self.put_entry_if(entry, || true);
    }

    /// Clear-then-insert only if `still_valid` holds under the write lock
    pub(crate) fn put_entry_if<F>(&self, entry: CacheEntry<V>, still_valid: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut entries = self.entries.write();
        if !still_valid() {
            return false;
        }
        let dropped = entries.len();
        entries.clear();
        debug!(
            "L1 Cache PUT: {} (region {} cleared, {} entries dropped)",
            entry.key, self.region, dropped
        );
        entries.insert(entry.key.clone(), entry);
        drop(entries);

        self.counters
            .clears
            .fetch_add(dropped as u64, Ordering::Relaxed);
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove `key` if held
    pub fn evict(&self, key: &CacheKey) {
        self.evict_if_present(key);
    }

    /// Remove `key`; returns whether it was held
    pub fn evict_if_present(&self, key: &CacheKey) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("L1 Cache EVICT: {}", key);
        }
        removed
    }

    /// Drop every entry of the region
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        drop(entries);

        self.counters
            .clears
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!("L1 Cache CLEAR region {} ({} entries)", self.region, count);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            clears: self.counters.clears.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<V: Clone + Send + Sync> EvictionTarget for LocalCache<V> {
    fn region(&self) -> &str {
        &self.region
    }

    fn evict_if_present(&self, key: &CacheKey) -> bool {
        LocalCache::evict_if_present(self, key)
    }

    fn clear(&self) {
        LocalCache::clear(self);
    }
}
