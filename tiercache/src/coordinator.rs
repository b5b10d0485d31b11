//! Cache coordinator
//!
//! Orchestrates reads and writes across L1 and L2 and applies inbound
//! invalidations to the process-local levels.
//!
//! Read path: L1, then L2 (populating L1), then the loader (writing L2 first,
//! then L1). Write path: L2, L1, then publish an invalidation so peers drop
//! their L1 copies. L2 and bus failures degrade the level instead of failing
//! the caller; only loader failures propagate.

use crate::bus::{BusTransport, InvalidationBus, Subscription};
use crate::config::TierConfig;
use crate::error::{BoxError, CacheError, Result};
use crate::local::{EvictionTarget, LocalCache, LocalCacheStats};
use crate::remote::{RemoteCache, RemoteTransport};
use crate::types::{CacheEntry, CacheKey, InvalidationMessage};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Coordinator statistics snapshot; every counter is monotonic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub remote_failures: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    pub publish_retries: u64,
    pub invalidations_received: u64,
    /// Invalidations that removed an entry from at least one level
    pub invalidations_applied: u64,
    /// L2 hits not copied into L1 because an invalidation arrived mid-read
    pub l1_fills_skipped: u64,
    /// Local clears forced by an interrupted invalidation stream
    pub resyncs: u64,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    remote_failures: AtomicU64,
    publishes: AtomicU64,
    publish_failures: AtomicU64,
    publish_retries: AtomicU64,
    invalidations_received: AtomicU64,
    invalidations_applied: AtomicU64,
    l1_fills_skipped: AtomicU64,
    resyncs: AtomicU64,
    /// Advances before any local eviction caused by the bus
    generation: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
            l1_fills_skipped: self.l1_fills_skipped.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Two-tier read-through cache for one region
pub struct CacheCoordinator<V> {
    region: Arc<str>,
    local: LocalCache<V>,
    remote: RemoteCache<V>,
    bus: InvalidationBus,
    publish_topic: Arc<str>,
    levels: Arc<Vec<Arc<dyn EvictionTarget>>>,
    in_flight: Option<InFlight>,
    counters: Arc<Counters>,
    publish_retry_delay: Duration,
    subscription: Mutex<Option<Subscription>>,
}

impl<V> CacheCoordinator<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder(config: TierConfig) -> CoordinatorBuilder<V> {
        CoordinatorBuilder::new(config)
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// This process's L1
    pub fn local(&self) -> &LocalCache<V> {
        &self.local
    }

    /// Return the cached value for `key`, loading and caching it on a full miss
    ///
    /// A key holding the "no value" marker yields [`CacheError::ValueAbsent`].
    pub async fn get_or_load<K, F, Fut, E>(&self, key: K, loader: F) -> Result<V>
    where
        K: Into<CacheKey>,
        F: FnOnce(CacheKey) -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<BoxError>,
    {
        let key = key.into();
        let value = self
            .resolve(key.clone(), move |k| {
                let load = loader(k);
                async move { load.await.map(Some) }
            })
            .await?;
        value.ok_or_else(|| CacheError::ValueAbsent(key.to_string()))
    }

    /// Like [`get_or_load`](Self::get_or_load), caching `None` as the
    /// "no value" marker
    pub async fn get_or_load_optional<K, F, Fut, E>(&self, key: K, loader: F) -> Result<Option<V>>
    where
        K: Into<CacheKey>,
        F: FnOnce(CacheKey) -> Fut,
        Fut: Future<Output = std::result::Result<Option<V>, E>>,
        E: Into<BoxError>,
    {
        self.resolve(key.into(), loader).await
    }

    /// Lookup-only read: L1, then L2; never invokes a loader
    pub async fn get<K: Into<CacheKey>>(&self, key: K) -> Option<V> {
        let key = key.into();
        if let Some(entry) = self.lookup_local(&key) {
            return entry.value;
        }
        self.lookup_remote(&key).await.and_then(|entry| entry.value)
    }

    /// Write `value` to L2 and L1, then publish an invalidation for `key`
    ///
    /// L2 and bus failures are logged and never fail the write; a failed
    /// publish is retried once in the background.
    pub async fn put<K: Into<CacheKey>>(&self, key: K, value: V) {
        let key = key.into();
        self.store_remote(&key, Some(&value)).await;
        self.local.put(key.clone(), value);
        self.publish_invalidation(&key).await;
    }

    /// Remove `key` from L2 and L1, then publish an invalidation
    pub async fn evict<K: Into<CacheKey>>(&self, key: K) {
        let key = key.into();
        if let Err(e) = self.remote.evict(&key).await {
            bump(&self.counters.remote_failures);
            warn!("L2 evict for key {} skipped: {}", key, e);
        }
        self.local.evict(&key);
        self.publish_invalidation(&key).await;
    }

    /// Drop every L1 entry of this process
    pub fn clear_local(&self) {
        self.local.clear();
    }

    /// Apply an invalidation as if it had been delivered by the bus
    pub fn handle_invalidation(&self, message: &InvalidationMessage) {
        apply_invalidation(&self.levels, &self.counters, message);
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }

    pub fn local_stats(&self) -> LocalCacheStats {
        self.local.stats()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    /// Release the invalidation subscription
    pub async fn close(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
        }
    }

    async fn resolve<F, Fut, E>(&self, key: CacheKey, loader: F) -> Result<Option<V>>
    where
        F: FnOnce(CacheKey) -> Fut,
        Fut: Future<Output = std::result::Result<Option<V>, E>>,
        E: Into<BoxError>,
    {
        if let Some(entry) = self.lookup_local(&key) {
            return Ok(entry.value);
        }

        let _permit = match &self.in_flight {
            Some(in_flight) => {
                let permit = in_flight.acquire(&key).await;
                // another caller may have finished the load while we waited
                if let Some(entry) = self.lookup_local(&key) {
                    return Ok(entry.value);
                }
                Some(permit)
            }
            None => None,
        };

        if let Some(entry) = self.lookup_remote(&key).await {
            return Ok(entry.value);
        }

        bump(&self.counters.loads);
        debug!("Loading key {} for region {}", key, self.region);

        let value = match loader(key.clone()).await {
            Ok(value) => value,
            Err(e) => {
                bump(&self.counters.load_failures);
                return Err(CacheError::LoaderFailure {
                    key: key.to_string(),
                    source: e.into(),
                });
            }
        };

        self.store_remote(&key, value.as_ref()).await;
        self.local.put_entry(CacheEntry {
            key,
            value: value.clone(),
        });

        Ok(value)
    }

    fn lookup_local(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.local.get(key)?;
        bump(&self.counters.l1_hits);
        Some(entry)
    }

    async fn lookup_remote(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let generation = self.counters.generation();
        match self.remote.get(key).await {
            Ok(Some(entry)) => {
                bump(&self.counters.l2_hits);
                // the value read may predate a write whose invalidation just landed
                let filled = self
                    .local
                    .put_entry_if(entry.clone(), || self.counters.generation() == generation);
                if !filled {
                    bump(&self.counters.l1_fills_skipped);
                    debug!("L1 fill for key {} skipped: invalidated during L2 read", key);
                }
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                bump(&self.counters.remote_failures);
                warn!("L2 lookup for key {} skipped: {}", key, e);
                None
            }
        }
    }

    async fn store_remote(&self, key: &CacheKey, value: Option<&V>) {
        if let Err(e) = self.remote.put(key, value).await {
            bump(&self.counters.remote_failures);
            warn!("L2 write for key {} skipped: {}", key, e);
        }
    }

    async fn publish_invalidation(&self, key: &CacheKey) {
        let e = match self.bus.publish(&self.publish_topic, key).await {
            Ok(()) => {
                bump(&self.counters.publishes);
                return;
            }
            Err(e) => e,
        };

        bump(&self.counters.publish_failures);
        warn!(
            "Invalidation publish for key {} failed, retrying in {:?}: {}",
            key, self.publish_retry_delay, e
        );

        let bus = self.bus.clone();
        let topic = self.publish_topic.clone();
        let key = key.clone();
        let counters = self.counters.clone();
        let delay = self.publish_retry_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bump(&counters.publish_retries);
            match bus.publish(&topic, &key).await {
                Ok(()) => {
                    bump(&counters.publishes);
                    info!("Invalidation for key {} published on retry", key);
                }
                Err(e) => {
                    bump(&counters.publish_failures);
                    error!("Invalidation for key {} dropped after retry: {}", key, e);
                }
            }
        });
    }
}

fn apply_invalidation(
    levels: &[Arc<dyn EvictionTarget>],
    counters: &Counters,
    message: &InvalidationMessage,
) {
    bump(&counters.invalidations_received);
    counters.advance_generation();

    let evicted = levels
        .iter()
        .filter(|level| level.evict_if_present(&message.key))
        .count();

    if evicted > 0 {
        bump(&counters.invalidations_applied);
    }
    debug!(
        "Invalidation for key {} evicted from {}/{} levels",
        message.key,
        evicted,
        levels.len()
    );
}

fn resync_local(levels: &[Arc<dyn EvictionTarget>], counters: &Counters) {
    bump(&counters.resyncs);
    counters.advance_generation();
    for level in levels {
        level.clear();
    }
    warn!(
        "Invalidations may have been missed, cleared {} local levels",
        levels.len()
    );
}

/// Builder for [`CacheCoordinator`]
pub struct CoordinatorBuilder<V> {
    config: TierConfig,
    local: Option<LocalCache<V>>,
    remote: Option<Arc<dyn RemoteTransport>>,
    bus: Option<Arc<dyn BusTransport>>,
    extra_levels: Vec<Arc<dyn EvictionTarget>>,
}

impl<V> CoordinatorBuilder<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(config: TierConfig) -> Self {
        Self {
            config,
            local: None,
            remote: None,
            bus: None,
            extra_levels: Vec::new(),
        }
    }

    /// Use an existing L1 instead of a fresh one
    pub fn local(mut self, local: LocalCache<V>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn remote(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.remote = Some(transport);
        self
    }

    pub fn bus(mut self, transport: Arc<dyn BusTransport>) -> Self {
        self.bus = Some(transport);
        self
    }

    /// Another process-local level that inbound invalidations evict from
    pub fn eviction_target(mut self, level: Arc<dyn EvictionTarget>) -> Self {
        self.extra_levels.push(level);
        self
    }

    /// Validate the levels and subscribe to invalidations
    pub async fn build(self) -> Result<CacheCoordinator<V>> {
        let config = self.config;
        let remote = self
            .remote
            .ok_or_else(|| CacheError::Config("remote transport is required".to_string()))?;
        let bus_transport = self
            .bus
            .ok_or_else(|| CacheError::Config("bus transport is required".to_string()))?;

        let local = self
            .local
            .unwrap_or_else(|| LocalCache::new(config.region.clone()));

        let mut levels: Vec<Arc<dyn EvictionTarget>> =
            Vec::with_capacity(1 + self.extra_levels.len());
        levels.push(Arc::new(local.clone()));
        levels.extend(self.extra_levels);
        if let Some(level) = levels.iter().find(|l| l.region() != config.region) {
            return Err(CacheError::Config(format!(
                "level region {} does not match configured region {}",
                level.region(),
                config.region
            )));
        }
        let levels = Arc::new(levels);

        let remote = RemoteCache::new(config.region.clone(), remote, config.remote_timeout())
            .with_entry_ttl(config.entry_ttl());
        let bus = InvalidationBus::new(bus_transport, config.bus_timeout())
            .with_reconnect_backoff(config.reconnect_delay(), config.max_reconnect_delay());
        let counters = Arc::new(Counters::default());

        let handler_levels = levels.clone();
        let handler_counters = counters.clone();
        let resync_levels = levels.clone();
        let resync_counters = counters.clone();
        let subscription = bus
            .subscribe_with_resync(
                config.topic(),
                move |message| apply_invalidation(&handler_levels, &handler_counters, &message),
                move || resync_local(&resync_levels, &resync_counters),
            )
            .await?;

        info!(
            "Cache coordinator ready: region={}, topic={}, publish_topic={}, levels={}, coalesce_loads={}",
            config.region,
            config.topic(),
            config.publish_topic(),
            levels.len(),
            config.coalesce_loads
        );

        Ok(CacheCoordinator {
            region: Arc::from(config.region.as_str()),
            publish_topic: Arc::from(config.publish_topic()),
            local,
            remote,
            bus,
            levels,
            in_flight: config.coalesce_loads.then(InFlight::default),
            counters,
            publish_retry_delay: config.publish_retry_delay(),
            subscription: Mutex::new(Some(subscription)),
        })
    }
}

/// Per-key load locks used when load coalescing is enabled
#[derive(Default)]
struct InFlight {
    locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl InFlight {
    async fn acquire(&self, key: &CacheKey) -> LoadPermit<'_> {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = lock.clone().lock_owned().await;
        LoadPermit {
            in_flight: self,
            key: key.clone(),
            lock,
            guard: Some(guard),
        }
    }
}

struct LoadPermit<'a> {
    in_flight: &'a InFlight,
    key: CacheKey,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LoadPermit<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.in_flight.locks.lock();
        // map + this permit; anything above that is a waiter
        let idle = locks
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.lock))
            && Arc::strong_count(&self.lock) == 2;
        if idle {
            locks.remove(&self.key);
        }
    }
}
