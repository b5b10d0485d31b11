pub mod error;
pub mod kv_store;
pub mod pubsub;
pub mod types;

pub use error::{Result, StoreError};
pub use kv_store::SharedStore;
pub use pubsub::{Message, PublishResult, RouterStats, SubscribeResult, TopicRouter};
pub use types::{StoreConfig, StoreStats, StoredValue};
