//! L2: shared remote cache
//!
//! [`RemoteCache`] is a thin adapter over a [`RemoteTransport`]: it encodes
//! values, bounds every round trip with a timeout and maps transport failures
//! to [`CacheError::CacheUnavailable`]. `put` is a targeted upsert.

use crate::error::{CacheError, Level, Result, TransportError};
use crate::types::{CacheEntry, CacheKey, remote_key};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes-in/bytes-out access to the shared store
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn get(
        &self,
        region: &str,
        key: &str,
    ) -> std::result::Result<Option<Vec<u8>>, TransportError>;

    async fn put(
        &self,
        region: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), TransportError>;

    async fn evict(&self, region: &str, key: &str) -> std::result::Result<bool, TransportError>;
}

/// Typed L2 level for one region
pub struct RemoteCache<V> {
    region: Arc<str>,
    transport: Arc<dyn RemoteTransport>,
    timeout: Duration,
    entry_ttl: Option<Duration>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for RemoteCache<V> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            transport: self.transport.clone(),
            timeout: self.timeout,
            entry_ttl: self.entry_ttl,
            _value: PhantomData,
        }
    }
}

impl<V> RemoteCache<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(
        region: impl Into<String>,
        transport: Arc<dyn RemoteTransport>,
        timeout: Duration,
    ) -> Self {
        let region: String = region.into();
        Self {
            region: Arc::from(region),
            transport,
            timeout,
            entry_ttl: None,
            _value: PhantomData,
        }
    }

    /// TTL handed to the store on every write
    pub fn with_entry_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.entry_ttl = ttl;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Fetch an entry; `Ok(None)` is a miss
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>> {
        let bytes = self
            .bounded("get", self.transport.get(&self.region, key.as_str()))
            .await?;

        match bytes {
            Some(bytes) => {
                debug!("L2 Cache HIT for key: {}", key);
                let value = decode::<V>(key, &bytes)?;
                Ok(Some(CacheEntry {
                    key: key.clone(),
                    value,
                }))
            }
            None => {
                debug!("L2 Cache MISS for key: {}", key);
                Ok(None)
            }
        }
    }

    /// Upsert `key`; `None` stores the "no value" marker
    pub async fn put(&self, key: &CacheKey, value: Option<&V>) -> Result<()> {
        let bytes = encode(key, value)?;
        let size = bytes.len();
        self.bounded(
            "put",
            self.transport
                .put(&self.region, key.as_str(), bytes, self.entry_ttl),
        )
        .await?;
        debug!("L2 Cache PUT: {} ({} bytes)", key, size);
        Ok(())
    }

    /// Remove `key`; returns whether the store held it
    pub async fn evict(&self, key: &CacheKey) -> Result<bool> {
        let removed = self
            .bounded("evict", self.transport.evict(&self.region, key.as_str()))
            .await?;
        debug!("L2 Cache EVICT: {} (removed={})", key, removed);
        Ok(removed)
    }

    async fn bounded<T, F>(&self, op: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::unavailable(
                Level::Remote,
                format!("{} failed: {}", op, e),
            )),
            Err(_) => Err(CacheError::unavailable(
                Level::Remote,
                format!("{} timed out after {:?}", op, self.timeout),
            )),
        }
    }
}

fn encode<V: Serialize>(key: &CacheKey, value: Option<&V>) -> Result<Vec<u8>> {
    serde_json::to_vec(&value).map_err(|e| CacheError::SerializationFailure {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<V: DeserializeOwned>(key: &CacheKey, bytes: &[u8]) -> Result<Option<V>> {
    serde_json::from_slice::<Option<V>>(bytes).map_err(|e| CacheError::SerializationFailure {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// In-process shared store
///
/// Clones share the same data, so several coordinators built over one store
/// behave like processes sharing one remote cache.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    data: Arc<RwLock<HashMap<String, StoredBytes>>>,
}

struct StoredBytes {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredBytes {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entries across all regions
    pub fn len(&self) -> usize {
        self.data.read().values().filter(|v| !v.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `region` currently holds `key`
    pub fn contains(&self, region: &str, key: &str) -> bool {
        self.data
            .read()
            .get(&remote_key(region, key))
            .is_some_and(|v| !v.is_expired())
    }
}

#[async_trait]
impl RemoteTransport for MemoryRemoteStore {
    async fn get(
        &self,
        region: &str,
        key: &str,
    ) -> std::result::Result<Option<Vec<u8>>, TransportError> {
        let full_key = remote_key(region, key);
        let mut data = self.data.write();
        match data.get(&full_key) {
            Some(stored) if stored.is_expired() => {
                data.remove(&full_key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.data.clone())),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        region: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), TransportError> {
        let stored = StoredBytes {
            data: value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.data.write().insert(remote_key(region, key), stored);
        Ok(())
    }

    async fn evict(&self, region: &str, key: &str) -> std::result::Result<bool, TransportError> {
        Ok(self.data.write().remove(&remote_key(region, key)).is_some())
    }
}
