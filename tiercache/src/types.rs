//! Common types for tiercache

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "Cache";

/// Cache key in its canonical string form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// UTF-8 bytes as carried by an invalidation message
    pub fn to_wire(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Parse an invalidation payload back into a key
    pub fn from_wire(payload: &[u8]) -> Option<Self> {
        std::str::from_utf8(payload).ok().map(Self::new)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&String> for CacheKey {
    fn from(key: &String) -> Self {
        Self(key.clone())
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Cached entry; `value == None` is the explicit "no value" marker
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    pub value: Option<V>,
}

impl<V> CacheEntry<V> {
    pub fn present(key: CacheKey, value: V) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    pub fn absent(key: CacheKey) -> Self {
        Self { key, value: None }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }
}

/// "Evict this key" notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub key: CacheKey,
}

/// Raw message delivered by a bus transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Composite key a region's entry is stored under in the shared store
pub fn remote_key(region: &str, key: &str) -> String {
    format!("{}::{}", region, key)
}
