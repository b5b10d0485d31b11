use super::error::{Result, StoreError};
use super::types::{StoreConfig, StoreStats, StoredValue};
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared key/value store backing every process's L2
#[derive(Clone)]
pub struct SharedStore {
    data: Arc<RwLock<Trie<String, StoredValue>>>,
    stats: Arc<RwLock<StoreStats>>,
    config: StoreConfig,
}

impl SharedStore {
    pub fn new(config: StoreConfig) -> Self {
        info!(
            "Initializing shared store with max_memory={}MB",
            config.max_memory_mb
        );

        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(StoreStats::default())),
            config,
        }
    }

    /// Start background TTL cleanup task
    pub fn start_ttl_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.config.ttl_cleanup_interval_ms.max(1);
        info!("Starting TTL cleanup task (interval={}ms)", interval_ms);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

            loop {
                interval.tick().await;
                store.cleanup_expired();
            }
        })
    }

    /// Insert or replace the value at `key`
    pub fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<()> {
        debug!("SET key={}, size={}, ttl={:?}", key, value.len(), ttl_secs);

        if ttl_secs == Some(0) {
            return Err(StoreError::InvalidValue("TTL must be at least 1 second".to_string()));
        }

        let stored = StoredValue::new(value, ttl_secs);
        let new_size = entry_size(key, &stored);
        let max_bytes = self.config.max_memory_mb * 1024 * 1024;

        let mut data = self.data.write();
        let mut stats = self.stats.write();

        let replaced_size = data.get(key).map(|old| entry_size(key, old)).unwrap_or(0);
        let projected = stats.total_memory_bytes.saturating_sub(replaced_size) + new_size;
        if projected > max_bytes {
            warn!(
                "Memory limit exceeded: {}/{}",
                stats.total_memory_bytes, max_bytes
            );
            return Err(StoreError::MemoryLimitExceeded);
        }

        let is_new = data.insert(key.to_string(), stored).is_none();

        stats.sets += 1;
        stats.total_memory_bytes = projected;
        if is_new {
            stats.total_keys += 1;
        }

        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        debug!("GET key={}", key);

        let mut data = self.data.write();
        let mut stats = self.stats.write();
        stats.gets += 1;

        let expired = match data.get(key) {
            Some(value) if !value.is_expired() => {
                stats.hits += 1;
                return Some(value.data.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            debug!("Key expired: {}", key);
            if let Some(old) = data.remove(key) {
                stats.total_memory_bytes =
                    stats.total_memory_bytes.saturating_sub(entry_size(key, &old));
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.expired += 1;
            }
        }
        stats.misses += 1;
        None
    }

    pub fn delete(&self, key: &str) -> bool {
        debug!("DELETE key={}", key);

        let mut data = self.data.write();
        match data.remove(key) {
            Some(old) => {
                let mut stats = self.stats.write();
                stats.dels += 1;
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.total_memory_bytes =
                    stats.total_memory_bytes.saturating_sub(entry_size(key, &old));
                !old.is_expired()
            }
            None => false,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.data
            .read()
            .get(key)
            .is_some_and(|value| !value.is_expired())
    }

    /// Live keys, optionally only those under `prefix` (e.g. `"{region}::"`)
    pub fn scan(&self, prefix: Option<&str>, limit: usize) -> Vec<String> {
        let data = self.data.read();
        match prefix {
            Some(prefix) => data
                .get_raw_descendant(prefix)
                .map(|subtrie| {
                    subtrie
                        .iter()
                        .filter(|(_, v)| !v.is_expired())
                        .map(|(k, _)| k.clone())
                        .take(limit)
                        .collect()
                })
                .unwrap_or_default(),
            None => data
                .iter()
                .filter(|(_, v)| !v.is_expired())
                .map(|(k, _)| k.clone())
                .take(limit)
                .collect(),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    fn cleanup_expired(&self) {
        let mut data = self.data.write();

        let expired_keys: Vec<String> = data
            .iter()
            .filter(|(_, v)| v.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        if expired_keys.is_empty() {
            return;
        }

        debug!("Cleaning up {} expired keys", expired_keys.len());
        let mut stats = self.stats.write();
        for key in expired_keys {
            if let Some(old) = data.remove(&key) {
                stats.total_memory_bytes = stats
                    .total_memory_bytes
                    .saturating_sub(entry_size(&key, &old));
                stats.total_keys = stats.total_keys.saturating_sub(1);
                stats.expired += 1;
            }
        }
    }
}

fn entry_size(key: &str, value: &StoredValue) -> usize {
    key.len() + value.data.len() + std::mem::size_of::<StoredValue>()
}
