use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Value held by the shared store
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub data: Vec<u8>,
    /// Expiration instant, if written with a TTL
    pub expires_at: Option<Instant>,
}

impl StoredValue {
    pub fn new(data: Vec<u8>, ttl_secs: Option<u64>) -> Self {
        Self {
            data,
            expires_at: ttl_secs.map(|secs| Instant::now() + Duration::from_secs(secs)),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires| Instant::now() >= expires)
    }
}

/// Configuration for the shared store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum memory in MB
    pub max_memory_mb: usize,
    /// TTL cleanup interval in milliseconds
    pub ttl_cleanup_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 1024,
            ttl_cleanup_interval_ms: 100,
        }
    }
}

/// Statistics for the shared store
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub total_keys: usize,
    /// Estimated memory usage in bytes
    pub total_memory_bytes: usize,
    pub gets: u64,
    pub sets: u64,
    pub dels: u64,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
}

impl StoreStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
