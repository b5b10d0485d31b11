//! Read-through, write-through and invalidation behavior of the coordinator

mod common;

use common::{
    Cluster, CountingLoader, DownRemote, FlakyBus, GatedRemote, StalledBus, StalledRemote,
    eventually, test_config,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiercache::{
    CacheCoordinator, CacheError, CacheKey, InvalidationBus, InvalidationMessage, LocalCache,
    MemoryBus, RemoteTransport, TierConfig,
};

fn key(k: &str) -> CacheKey {
    CacheKey::from(k)
}

async fn publish_invalidation(cluster: &Cluster, topic: &str, k: &str) {
    InvalidationBus::new(Arc::new(cluster.bus.clone()), Duration::from_secs(1))
        .publish(topic, &key(k))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_full_miss_loads_once_and_populates_both_levels() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    let value = cache.get_or_load("a", loader.echo()).await.unwrap();

    assert_eq!(value, "a");
    assert_eq!(loader.calls(), 1);
    assert!(cache.local().contains(&key("a")));
    assert!(cluster.store.contains("Cache", "a"));

    let value = cache.get_or_load("a", loader.echo()).await.unwrap();
    assert_eq!(value, "a");
    assert_eq!(loader.calls(), 1);

    let stats = cache.stats();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.l1_hits, 1);
}

#[tokio::test]
async fn test_put_then_read_skips_loader() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    cache.put("user:1", "John".to_string()).await;

    let value = cache.get_or_load("user:1", loader.echo()).await.unwrap();
    assert_eq!(value, "John");
    assert_eq!(loader.calls(), 0);
    assert_eq!(cache.stats().publishes, 1);
}

#[tokio::test]
async fn test_write_clears_other_l1_entries_but_not_l2() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    cache.get_or_load("b", loader.echo()).await.unwrap();
    cache.local().put(key("a"), "va".to_string());

    assert!(!cache.local().contains(&key("b")));
    assert_eq!(cache.local().len(), 1);

    let l2_hits = cache.stats().l2_hits;
    let value = cache.get_or_load("b", loader.echo()).await.unwrap();
    assert_eq!(value, "b");
    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.stats().l2_hits, l2_hits + 1);
}

#[tokio::test]
async fn test_end_to_end_a_b_scenario() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    // first read of "a" loads it
    assert_eq!(cache.get_or_load("a", loader.echo()).await.unwrap(), "a");
    assert_eq!(loader.calls(), 1);

    // second read is an L1 hit
    assert_eq!(cache.get_or_load("a", loader.echo()).await.unwrap(), "a");
    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.stats().l1_hits, 1);

    // loading "b" clears "a" from L1 only
    assert_eq!(cache.get_or_load("b", loader.echo()).await.unwrap(), "b");
    assert_eq!(loader.calls(), 2);
    assert!(!cache.local().contains(&key("a")));
    assert!(cluster.store.contains("Cache", "a"));

    // "a" comes back from L2 and repopulates L1
    assert_eq!(cache.get_or_load("a", loader.echo()).await.unwrap(), "a");
    assert_eq!(loader.calls(), 2);
    assert_eq!(cache.stats().l2_hits, 1);
    assert!(cache.local().contains(&key("a")));
}

#[tokio::test]
async fn test_invalidation_evicts_every_subscribed_process() {
    let cluster = Cluster::new();
    let p1 = cluster.process(test_config()).await;
    let p2 = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    p1.get_or_load("k", loader.echo()).await.unwrap();
    p2.get_or_load("k", loader.echo()).await.unwrap();
    assert_eq!(loader.calls(), 1);
    assert!(p2.local().contains(&key("k")));

    publish_invalidation(&cluster, "Cache", "k").await;

    assert!(
        eventually(|| !p1.local().contains(&key("k")) && !p2.local().contains(&key("k"))).await
    );

    assert_eq!(p2.get_or_load("k", loader.echo()).await.unwrap(), "k");
    assert_eq!(loader.calls(), 1);
    assert!(p2.local().contains(&key("k")));
}

#[tokio::test]
async fn test_duplicate_invalidation_is_idempotent() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;

    cache.local().put(key("k"), "v".to_string());

    publish_invalidation(&cluster, "Cache", "k").await;
    publish_invalidation(&cluster, "Cache", "k").await;

    assert!(eventually(|| cache.stats().invalidations_received == 2).await);
    assert_eq!(cache.stats().invalidations_applied, 1);
    assert!(cache.local().is_empty());
    assert_eq!(cache.local_stats().evictions, 1);
}

#[tokio::test]
async fn test_invalidation_for_uncached_key_is_noop() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    cache.local().put(key("a"), "va".to_string());

    publish_invalidation(&cluster, "Cache", "missing").await;

    assert!(eventually(|| cache.stats().invalidations_received == 1).await);
    assert_eq!(cache.stats().invalidations_applied, 0);
    assert!(cache.local().contains(&key("a")));
}

#[tokio::test]
async fn test_invalidation_leaves_l2_untouched() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    cache.get_or_load("k", CountingLoader::new().echo()).await.unwrap();

    publish_invalidation(&cluster, "Cache", "k").await;

    assert!(eventually(|| !cache.local().contains(&key("k"))).await);
    assert!(cluster.store.contains("Cache", "k"));
}

#[tokio::test]
async fn test_other_region_topic_is_ignored() {
    let cluster = Cluster::new();
    let users = cluster.process(TierConfig::new("Users")).await;
    let orders = cluster.process(TierConfig::new("Orders")).await;

    orders.local().put(key("1"), "order".to_string());
    users.put("1", "user".to_string()).await;

    assert!(eventually(|| users.stats().invalidations_received == 1).await);
    assert!(orders.local().contains(&key("1")));
    assert_eq!(orders.stats().invalidations_received, 0);
    assert!(!cluster.store.contains("Orders", "1"));
    assert!(cluster.store.contains("Users", "1"));
}

#[tokio::test]
async fn test_wildcard_topic_receives_region_invalidations() {
    let cluster = Cluster::new();
    let listener = cluster
        .process(TierConfig::new("Cache").with_invalidation_topic("*"))
        .await;
    listener.local().put(key("k"), "v".to_string());

    publish_invalidation(&cluster, "Cache", "k").await;

    assert!(eventually(|| !listener.local().contains(&key("k"))).await);
}

#[tokio::test]
async fn test_custom_topic_reaches_peers() {
    let cluster = Cluster::new();
    let config = || test_config().with_invalidation_topic("invalidations");
    let writer = cluster.process(config()).await;
    let peer = cluster.process(config()).await;
    peer.local().put(key("k1"), "stale".to_string());

    writer.put("k1", "v1".to_string()).await;

    assert!(eventually(|| !peer.local().contains(&key("k1"))).await);
    assert_eq!(peer.stats().invalidations_received, 1);
    assert_eq!(peer.get("k1").await, Some("v1".to_string()));
}

#[tokio::test]
async fn test_evict_removes_both_levels_and_notifies_peers() {
    let cluster = Cluster::new();
    let p1 = cluster.process(test_config()).await;
    let p2 = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    p1.get_or_load("k", loader.echo()).await.unwrap();
    p2.get_or_load("k", loader.echo()).await.unwrap();

    p1.evict("k").await;

    assert!(!p1.local().contains(&key("k")));
    assert!(!cluster.store.contains("Cache", "k"));
    assert!(eventually(|| !p2.local().contains(&key("k"))).await);

    p2.get_or_load("k", loader.echo()).await.unwrap();
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_extra_eviction_target_is_invalidated() {
    let cluster = Cluster::new();
    let near = LocalCache::<String>::new("Cache");
    near.put(key("k"), "near copy".to_string());

    let cache = CacheCoordinator::<String>::builder(test_config())
        .remote(Arc::new(cluster.store.clone()))
        .bus(Arc::new(cluster.bus.clone()))
        .eviction_target(Arc::new(near.clone()))
        .build()
        .await
        .unwrap();

    publish_invalidation(&cluster, "Cache", "k").await;

    assert!(eventually(|| !near.contains(&key("k"))).await);
    assert_eq!(cache.stats().invalidations_applied, 1);
}

#[tokio::test]
async fn test_optional_loader_caches_absent_marker() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        let value = cache
            .get_or_load_optional("ghost", move |_| async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<Option<String>, std::io::Error>(None)
            })
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(cluster.store.contains("Cache", "ghost"));
    assert_eq!(cache.get("ghost").await, None);

    let loader = CountingLoader::new();
    let result = cache.get_or_load("ghost", loader.echo()).await;
    assert!(matches!(result, Err(CacheError::ValueAbsent(k)) if k == "ghost"));
    assert_eq!(loader.calls(), 0);
}

#[tokio::test]
async fn test_get_never_loads() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;

    assert_eq!(cache.get("nothing").await, None);
    assert_eq!(cache.stats().loads, 0);

    let peer = cluster.process(test_config()).await;
    peer.put("k", "from peer".to_string()).await;
    assert!(eventually(|| cache.stats().invalidations_received == 1).await);

    assert_eq!(cache.get("k").await, Some("from peer".to_string()));
    assert!(cache.local().contains(&key("k")));
}

#[tokio::test]
async fn test_loader_failure_propagates_uncached() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    let result = cache.get_or_load("k", loader.failing()).await;

    match result {
        Err(CacheError::LoaderFailure { key, source }) => {
            assert_eq!(key, "k");
            assert_eq!(source.to_string(), "database unavailable for k");
        }
        other => panic!("expected loader failure, got {:?}", other),
    }
    assert!(cache.local().is_empty());
    assert!(cluster.store.is_empty());
    assert_eq!(cache.stats().load_failures, 1);

    let value = cache.get_or_load("k", loader.echo()).await.unwrap();
    assert_eq!(value, "k");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_l2_down_degrades_to_loader_and_l1() {
    let bus = MemoryBus::new();
    let cache = CacheCoordinator::<String>::builder(test_config())
        .remote(Arc::new(DownRemote))
        .bus(Arc::new(bus))
        .build()
        .await
        .unwrap();
    let loader = CountingLoader::new();

    let value = cache.get_or_load("k", loader.echo()).await.unwrap();
    assert_eq!(value, "k");
    assert!(cache.local().contains(&key("k")));

    let value = cache.get_or_load("k", loader.echo()).await.unwrap();
    assert_eq!(value, "k");
    assert_eq!(loader.calls(), 1);

    // lookup + write both skipped
    assert_eq!(cache.stats().remote_failures, 2);

    cache.put("k", "v2".to_string()).await;
    cache.evict("k").await;
    assert_eq!(cache.stats().remote_failures, 4);
}

#[tokio::test]
async fn test_unencodable_value_still_served_from_l1() {
    // JSON object keys must be strings, so tuple keys cannot be encoded
    type Grid = HashMap<(u8, u8), String>;

    let cluster = Cluster::new();
    let cache = CacheCoordinator::<Grid>::builder(test_config())
        .remote(Arc::new(cluster.store.clone()))
        .bus(Arc::new(cluster.bus.clone()))
        .build()
        .await
        .unwrap();

    let value = cache
        .get_or_load("grid", |_| async {
            Ok::<_, std::io::Error>(HashMap::from([((0, 0), "origin".to_string())]))
        })
        .await
        .unwrap();
    assert_eq!(value[&(0, 0)], "origin");

    assert!(cache.local().contains(&key("grid")));
    assert!(!cluster.store.contains("Cache", "grid"));
    assert_eq!(cache.stats().remote_failures, 1);
}

#[tokio::test]
async fn test_l2_and_loader_failure_surfaces_loader_error() {
    let cache = CacheCoordinator::<String>::builder(test_config())
        .remote(Arc::new(DownRemote))
        .bus(Arc::new(MemoryBus::new()))
        .build()
        .await
        .unwrap();

    let result = cache.get_or_load("k", CountingLoader::new().failing()).await;
    assert!(matches!(result, Err(CacheError::LoaderFailure { .. })));
}

#[tokio::test]
async fn test_stalled_l2_is_bounded_by_timeout() {
    let config = test_config().with_remote_timeout(Duration::from_millis(50));
    let cache = CacheCoordinator::<String>::builder(config)
        .remote(Arc::new(StalledRemote))
        .bus(Arc::new(MemoryBus::new()))
        .build()
        .await
        .unwrap();

    let started = Instant::now();
    let value = cache
        .get_or_load("k", CountingLoader::new().echo())
        .await
        .unwrap();

    assert_eq!(value, "k");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(cache.stats().remote_failures, 2);
}

#[tokio::test]
async fn test_failed_publish_is_retried_once() {
    let cluster = Cluster::new();
    let peer = cluster.process(test_config()).await;
    let writer = CacheCoordinator::<String>::builder(test_config())
        .remote(Arc::new(cluster.store.clone()))
        .bus(Arc::new(FlakyBus::new(cluster.bus.clone(), 1)))
        .build()
        .await
        .unwrap();

    peer.local().put(key("k"), "stale".to_string());
    writer.put("k", "fresh".to_string()).await;

    let stats = writer.stats();
    assert_eq!(stats.publish_failures, 1);

    assert!(eventually(|| writer.stats().publishes == 1).await);
    assert_eq!(writer.stats().publish_retries, 1);
    assert!(eventually(|| !peer.local().contains(&key("k"))).await);
    assert_eq!(peer.get("k").await, Some("fresh".to_string()));
}

#[tokio::test]
async fn test_stalled_publish_is_bounded_by_timeout() {
    let cluster = Cluster::new();
    let writer = CacheCoordinator::<String>::builder(test_config())
        .remote(Arc::new(cluster.store.clone()))
        .bus(Arc::new(StalledBus::new(cluster.bus.clone())))
        .build()
        .await
        .unwrap();

    let started = Instant::now();
    writer.put("k", "v".to_string()).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(writer.stats().publish_failures, 1);
    assert!(cluster.store.contains("Cache", "k"));

    assert!(eventually(|| writer.stats().publish_retries == 1).await);
    assert!(eventually(|| writer.stats().publish_failures == 2).await);
    assert_eq!(writer.stats().publishes, 0);
}

#[tokio::test]
async fn test_publish_dropped_after_single_retry() {
    let cluster = Cluster::new();
    let writer = CacheCoordinator::<String>::builder(test_config())
        .remote(Arc::new(cluster.store.clone()))
        .bus(Arc::new(FlakyBus::new(cluster.bus.clone(), 5)))
        .build()
        .await
        .unwrap();

    writer.put("k", "v".to_string()).await;

    assert!(eventually(|| writer.stats().publish_retries == 1).await);
    assert!(eventually(|| writer.stats().publish_failures == 2).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = writer.stats();
    assert_eq!(stats.publish_retries, 1);
    assert_eq!(stats.publishes, 0);
    // the write itself still landed
    assert!(cluster.store.contains("Cache", "k"));
}

#[tokio::test]
async fn test_coalesced_loads_invoke_loader_once() {
    let cluster = Cluster::new();
    let cache = cluster
        .process(test_config().with_coalesced_loads(true))
        .await;
    let loader = CountingLoader::new();
    let delay = Duration::from_millis(50);

    let (a, b, c) = tokio::join!(
        cache.get_or_load("hot", loader.slow(delay)),
        cache.get_or_load("hot", loader.slow(delay)),
        cache.get_or_load("hot", loader.slow(delay)),
    );

    assert_eq!(a.unwrap(), "hot");
    assert_eq!(b.unwrap(), "hot");
    assert_eq!(c.unwrap(), "hot");
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_uncoalesced_loads_may_duplicate() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let loader = CountingLoader::new();
    let delay = Duration::from_millis(50);

    let (a, b) = tokio::join!(
        cache.get_or_load("hot", loader.slow(delay)),
        cache.get_or_load("hot", loader.slow(delay)),
    );

    assert_eq!(a.unwrap(), "hot");
    assert_eq!(b.unwrap(), "hot");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_dropped_stream_resubscribes_and_clears_local() {
    let cluster = Cluster::new();
    let writer = cluster.process(test_config()).await;
    let peer = cluster.process(test_config()).await;
    peer.local().put(key("k"), "stale".to_string());

    cluster.bus.disconnect_all();

    // cleared when the stream ended and again once it was back
    assert!(eventually(|| peer.stats().resyncs == 2).await);
    assert!(!peer.local().contains(&key("k")));
    assert!(peer.is_subscribed());
    assert!(eventually(|| cluster.bus.subscriber_count() == 2).await);

    peer.local().put(key("k"), "stale".to_string());
    writer.put("k", "fresh".to_string()).await;

    assert!(eventually(|| !peer.local().contains(&key("k"))).await);
    assert_eq!(peer.get("k").await, Some("fresh".to_string()));
}

#[tokio::test]
async fn test_invalidation_during_l2_read_skips_l1_fill() {
    let cluster = Cluster::new();
    cluster
        .store
        .put("Cache", "k", br#""old""#.to_vec(), None)
        .await
        .unwrap();

    let remote = Arc::new(GatedRemote::new(cluster.store.clone()));
    let cache = CacheCoordinator::<String>::builder(test_config())
        .remote(remote.clone())
        .bus(Arc::new(cluster.bus.clone()))
        .build()
        .await
        .unwrap();

    let (value, ()) = tokio::join!(cache.get("k"), async {
        remote.started.notified().await;
        cache.handle_invalidation(&InvalidationMessage { key: key("k") });
        remote.release.notify_one();
    });

    assert_eq!(value, Some("old".to_string()));
    assert!(!cache.local().contains(&key("k")));
    assert_eq!(cache.stats().l1_fills_skipped, 1);
}

#[tokio::test]
async fn test_close_stops_invalidation_delivery() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    cache.local().put(key("k"), "v".to_string());

    cache.close().await;
    assert!(!cache.is_subscribed());

    publish_invalidation(&cluster, "Cache", "k").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(cache.local().contains(&key("k")));
    assert_eq!(cache.stats().invalidations_received, 0);
}

#[tokio::test]
async fn test_subscribe_failure_fails_build() {
    let config = TierConfig::new("Cache").with_invalidation_topic("#.bad");
    let result = CacheCoordinator::<String>::builder(config)
        .remote(Arc::new(Cluster::new().store))
        .bus(Arc::new(MemoryBus::new()))
        .build()
        .await;

    assert!(matches!(result, Err(CacheError::CacheUnavailable { .. })));
}

#[tokio::test]
async fn test_clear_local_keeps_l2() {
    let cluster = Cluster::new();
    let cache = cluster.process(test_config()).await;
    let loader = CountingLoader::new();

    cache.get_or_load("k", loader.echo()).await.unwrap();
    cache.clear_local();

    assert!(cache.local().is_empty());
    assert_eq!(cache.get_or_load("k", loader.echo()).await.unwrap(), "k");
    assert_eq!(loader.calls(), 1);
    let local = cache.local_stats();
    assert_eq!(local.clears, 1);
    assert_eq!(local.puts, 2);
}
