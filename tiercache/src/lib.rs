//! # tiercache
//!
//! Two-tier read-through cache: a fast in-process L1 backed by a shared,
//! network-reachable L2, kept coherent across processes by a publish/subscribe
//! invalidation channel.
//!
//! - **L1** ([`LocalCache`]): every `put` clears the region before inserting,
//!   so L1 never serves a value cached before an unrelated write.
//! - **L2** ([`RemoteCache`]): authoritative shared store, targeted upserts.
//! - **Bus** ([`InvalidationBus`]): "evict this key" broadcasts, dispatched on
//!   a dedicated task per subscription.
//! - **Coordinator** ([`CacheCoordinator`]): L1 → L2 → loader on reads;
//!   L2 → L1 → publish on writes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tiercache::{CacheCoordinator, ClientConfig, HttpTransport, TierConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TierConfig::new("Cache").with_remote_url("http://localhost:15500");
//!     let transport = Arc::new(HttpTransport::new(ClientConfig::from_tier(&config))?);
//!
//!     let cache = CacheCoordinator::<String>::builder(config)
//!         .remote(transport.clone())
//!         .bus(transport)
//!         .build()
//!         .await?;
//!
//!     let user = cache
//!         .get_or_load("user:1", |key| async move {
//!             Ok::<_, std::io::Error>(format!("loaded {}", key))
//!         })
//!         .await?;
//!     println!("{}", user);
//!
//!     cache.put("user:1", "John Doe".to_string()).await;
//!     cache.close().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod local;
pub mod remote;
pub mod types;

pub use bus::{BusStream, BusTransport, InvalidationBus, MemoryBus, Subscription, TopicPattern};
pub use client::{ClientConfig, HttpTransport};
pub use config::{BusConfig, RemoteConfig, TierConfig};
pub use coordinator::{CacheCoordinator, CoordinatorBuilder, CoordinatorStats};
pub use error::{BoxError, CacheError, Level, Result, TransportError};
pub use local::{EvictionTarget, LocalCache, LocalCacheStats};
pub use remote::{MemoryRemoteStore, RemoteCache, RemoteTransport};
pub use types::{BusMessage, CacheEntry, CacheKey, DEFAULT_REGION, InvalidationMessage};
