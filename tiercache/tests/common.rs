//! Common test utilities

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tiercache::{
    BoxError, BusStream, BusTransport, CacheCoordinator, CacheKey, MemoryBus, MemoryRemoteStore,
    RemoteTransport, TierConfig, TransportError,
};

type BoxFuture<T> = std::pin::Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;

/// One shared store and one bus; every coordinator built from it acts as a
/// separate process
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct Cluster {
    pub store: MemoryRemoteStore,
    pub bus: MemoryBus,
}

#[allow(dead_code)] // Used by other test modules
impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn process(&self, config: TierConfig) -> CacheCoordinator<String> {
        CacheCoordinator::builder(config)
            .remote(Arc::new(self.store.clone()))
            .bus(Arc::new(self.bus.clone()))
            .build()
            .await
            .unwrap()
    }
}

/// Test configuration with short timeouts
#[allow(dead_code)] // Used by other test modules
pub fn test_config() -> TierConfig {
    TierConfig::default()
        .with_remote_timeout(Duration::from_millis(200))
        .with_bus_timeout(Duration::from_millis(200))
        .with_publish_retry_delay(Duration::from_millis(20))
        .with_reconnect_delay(Duration::from_millis(10), Duration::from_millis(50))
}

/// Loader that echoes the key and counts its invocations
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct CountingLoader {
    calls: Arc<AtomicUsize>,
}

#[allow(dead_code)] // Used by other test modules
impl CountingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Loader returning the key itself
    pub fn echo(&self) -> impl FnOnce(CacheKey) -> std::future::Ready<Result<String, BoxError>> {
        let calls = self.calls.clone();
        move |key| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(key.to_string()))
        }
    }

    /// Loader returning `value`
    pub fn value(
        &self,
        value: &str,
    ) -> impl FnOnce(CacheKey) -> std::future::Ready<Result<String, BoxError>> {
        let calls = self.calls.clone();
        let value = value.to_string();
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    /// Loader that sleeps for `delay` before echoing the key
    pub fn slow(&self, delay: Duration) -> impl FnOnce(CacheKey) -> BoxFuture<String> {
        let calls = self.calls.clone();
        move |key| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(key.to_string())
            })
        }
    }

    /// Loader that always fails
    pub fn failing(&self) -> impl FnOnce(CacheKey) -> std::future::Ready<Result<String, BoxError>> {
        let calls = self.calls.clone();
        move |key| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(format!("database unavailable for {}", key).into()))
        }
    }
}

/// Shared store that refuses every call
#[allow(dead_code)]
pub struct DownRemote;

#[async_trait]
impl RemoteTransport for DownRemote {
    async fn get(&self, _: &str, _: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Err(TransportError::Server("connection refused".to_string()))
    }

    async fn put(
        &self,
        _: &str,
        _: &str,
        _: Vec<u8>,
        _: Option<Duration>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Server("connection refused".to_string()))
    }

    async fn evict(&self, _: &str, _: &str) -> Result<bool, TransportError> {
        Err(TransportError::Server("connection refused".to_string()))
    }
}

/// Shared store that never answers
#[allow(dead_code)]
pub struct StalledRemote;

#[async_trait]
impl RemoteTransport for StalledRemote {
    async fn get(&self, _: &str, _: &str) -> Result<Option<Vec<u8>>, TransportError> {
        std::future::pending().await
    }

    async fn put(
        &self,
        _: &str,
        _: &str,
        _: Vec<u8>,
        _: Option<Duration>,
    ) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn evict(&self, _: &str, _: &str) -> Result<bool, TransportError> {
        std::future::pending().await
    }
}

/// Bus whose first `failures` publishes fail
#[allow(dead_code)]
pub struct FlakyBus {
    inner: MemoryBus,
    failures: AtomicUsize,
}

#[allow(dead_code)] // Used by other test modules
impl FlakyBus {
    pub fn new(inner: MemoryBus, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl BusTransport for FlakyBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Server("bus unavailable".to_string()));
        }
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, TransportError> {
        self.inner.subscribe(topic).await
    }
}

/// Bus whose publishes never complete
#[allow(dead_code)]
pub struct StalledBus {
    inner: MemoryBus,
}

#[allow(dead_code)] // Used by other test modules
impl StalledBus {
    pub fn new(inner: MemoryBus) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BusTransport for StalledBus {
    async fn publish(&self, _: &str, _: Vec<u8>) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream, TransportError> {
        self.inner.subscribe(topic).await
    }
}

/// Shared store whose reads signal `started`, then hold until `release`
#[allow(dead_code)]
pub struct GatedRemote {
    inner: MemoryRemoteStore,
    pub started: Notify,
    pub release: Notify,
}

#[allow(dead_code)] // Used by other test modules
impl GatedRemote {
    pub fn new(inner: MemoryRemoteStore) -> Self {
        Self {
            inner,
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl RemoteTransport for GatedRemote {
    async fn get(&self, region: &str, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.get(region, key).await
    }

    async fn put(
        &self,
        region: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), TransportError> {
        self.inner.put(region, key, value, ttl).await
    }

    async fn evict(&self, region: &str, key: &str) -> Result<bool, TransportError> {
        self.inner.evict(region, key).await
    }
}

/// Poll `condition` until it holds or one second passes
#[allow(dead_code)] // Used by other test modules
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Route logs to the test harness; filter with `RUST_LOG`
#[allow(dead_code)] // Used by other test modules
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawn a tiercache-server on a random port and return its base URL
#[allow(dead_code)] // Used by other test modules
pub async fn spawn_server() -> String {
    init_tracing();
    let state = tiercache_server::build_state(&tiercache_server::ServerConfig::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        tiercache_server::serve(listener, state).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://{}", addr)
}
