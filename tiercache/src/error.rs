//! Error types for tiercache

use thiserror::Error;

/// Boxed error returned by caller-supplied loaders
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache level that produced a degraded result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Shared remote store
    Remote,
    /// Invalidation bus
    Bus,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => f.write_str("L2"),
            Self::Bus => f.write_str("invalidation bus"),
        }
    }
}

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// Network failure or timeout talking to L2 or the bus
    #[error("{level} unavailable: {reason}")]
    CacheUnavailable { level: Level, reason: String },

    /// The loader failed; nothing was cached
    #[error("Loader failed for key {key}: {source}")]
    LoaderFailure {
        key: String,
        #[source]
        source: BoxError,
    },

    /// Value could not be encoded or decoded for L2
    #[error("Serialization failed for key {key}: {reason}")]
    SerializationFailure { key: String, reason: String },

    /// The key is cached with the explicit "no value" marker
    #[error("No value cached for key: {0}")]
    ValueAbsent(String),

    /// Invalid configuration or construction
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn unavailable(level: Level, reason: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            level,
            reason: reason.into(),
        }
    }

    /// True for errors that degrade a level instead of failing the caller
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::CacheUnavailable { .. } | Self::SerializationFailure { .. }
        )
    }
}

/// Errors raised by remote and bus transports
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket connection or framing error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Server returned an error
    #[error("Server error: {0}")]
    Server(String),

    /// Topic or topic pattern rejected
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Payload could not be carried by the transport
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Invalid transport configuration
    #[error("Invalid transport configuration: {0}")]
    Config(String),

    /// Invalid response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Transport was shut down
    #[error("Transport closed")]
    Closed,
}
