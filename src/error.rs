/// Error type for cache operations.
///
/// `Clone` so that every caller coalesced onto one in-flight request can observe the
/// same failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Transient failure talking to the origin. Retried with backoff.
    #[error("network error for key '{key}': {message}")]
    Network { key: String, message: String },

    /// The origin reports the resource does not exist. Never retried.
    #[error("resource not found for key '{key}'")]
    NotFound { key: String },

    /// A persistent tier failed. Logged and absorbed by the engine.
    #[error("[{tier}] persistence error for key '{key}': {message}")]
    Persistence {
        tier: String,
        key: String,
        message: String,
    },

    /// A persistent tier ran out of space.
    #[error("[{tier}] storage quota exceeded while writing key '{key}'")]
    QuotaExceeded { tier: String, key: String },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The cache configuration violates an invariant.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// An operation needed to re-fetch a key that was never fetched.
    #[error("no remote fetcher registered for key '{0}'")]
    NoFetcher(String),
}

impl CacheError {
    /// Create a new network error.
    pub fn network(key: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Network {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a new not-found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        CacheError::NotFound { key: key.into() }
    }

    /// Create a new persistence error.
    pub fn persistence(
        tier: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Persistence {
            tier: tier.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a new quota error.
    pub fn quota_exceeded(tier: impl Into<String>, key: impl Into<String>) -> Self {
        CacheError::QuotaExceeded {
            tier: tier.into(),
            key: key.into(),
        }
    }

    /// Whether a failed remote fetch may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Network { .. })
    }
}
