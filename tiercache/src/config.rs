//! Cache hierarchy configuration
//!
//! YAML-loadable, every section optional. Durations are carried in
//! milliseconds and exposed as [`Duration`] accessors.

use crate::types::DEFAULT_REGION;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Cache hierarchy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Region shared by L1 and L2
    pub region: String,
    /// Topic to listen on; defaults to the region name
    pub invalidation_topic: Option<String>,
    /// Serialize concurrent misses on one key behind a single loader call
    pub coalesce_loads: bool,
    pub remote: RemoteConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the shared store
    pub url: String,
    pub timeout_ms: u64,
    /// TTL applied by the shared store to every entry written
    pub entry_ttl_secs: Option<u64>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub timeout_ms: u64,
    /// Delay before the single retry of a failed invalidation publish
    pub publish_retry_delay_ms: u64,
    /// First delay before resubscribing after the invalidation stream ends;
    /// doubles per failed attempt
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            invalidation_topic: None,
            coalesce_loads: false,
            remote: RemoteConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:15500".to_string(),
            timeout_ms: 2_000,
            entry_ttl_secs: None,
            auth_token: None,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            publish_retry_delay_ms: 500,
            reconnect_delay_ms: 100,
            max_reconnect_delay_ms: 5_000,
        }
    }
}

impl TierConfig {
    /// Create a configuration for `region` with default timeouts
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TierConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn with_invalidation_topic(mut self, topic: impl Into<String>) -> Self {
        self.invalidation_topic = Some(topic.into());
        self
    }

    pub fn with_coalesced_loads(mut self, enabled: bool) -> Self {
        self.coalesce_loads = enabled;
        self
    }

    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote.url = url.into();
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.remote.entry_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_bus_timeout(mut self, timeout: Duration) -> Self {
        self.bus.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.bus.reconnect_delay_ms = initial.as_millis() as u64;
        self.bus.max_reconnect_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_publish_retry_delay(mut self, delay: Duration) -> Self {
        self.bus.publish_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Topic the coordinator subscribes on
    pub fn topic(&self) -> &str {
        self.invalidation_topic.as_deref().unwrap_or(&self.region)
    }

    /// Topic the coordinator publishes on: the configured topic, or the
    /// region name when that topic is a wildcard pattern
    pub fn publish_topic(&self) -> &str {
        let topic = self.topic();
        let is_pattern = topic.split('.').any(|seg| seg == "*" || seg == "#");
        if is_pattern { &self.region } else { topic }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.timeout_ms)
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        self.remote.entry_ttl_secs.map(Duration::from_secs)
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus.timeout_ms)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bus.publish_retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.bus.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.bus.max_reconnect_delay_ms)
    }
}
