//! Shared key/value store and invalidation broker for `tiercache`
//!
//! Serves L2 reads and writes over the StreamableHTTP command endpoint and
//! fans invalidation messages out to WebSocket subscribers.

pub mod config;
pub mod core;
pub mod protocol;
pub mod server;

pub use config::ServerConfig;
pub use core::{SharedStore, StoreConfig, StoreError, StoreStats, TopicRouter};
pub use protocol::{Request, Response};
pub use server::{AppState, create_router};

/// Build the store and router described by `config` and start TTL cleanup
///
/// Must be called from within a Tokio runtime.
pub fn build_state(config: &ServerConfig) -> AppState {
    let store = SharedStore::new(config.store.clone());
    store.start_ttl_cleanup();
    AppState::new(store, TopicRouter::new())
}

/// Serve `state` on an already bound listener until the listener fails
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, create_router(state)).await
}
