//! Cache configuration.
//!
//! Every engine is configured with its own timing and retry policy. Values can be built in
//! code, deserialized, or loaded from prefixed environment variables.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CacheError;

/// Timing, retry and versioning policy of one cache engine.
///
/// All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which an entry is stale and gets revalidated.
    pub stale_time_ms: i64,
    /// Age after which an entry is expired and no longer served as a hit.
    pub cache_time_ms: i64,
    /// Extra attempts after the first failed remote fetch.
    pub retry_count: u32,
    /// Base delay of the exponential backoff between attempts.
    pub retry_delay_ms: u64,
    /// Period of the background revalidation sweep. `0` disables it.
    pub background_refetch_interval_ms: u64,
    /// Version stamped on every entry. Persisted entries of another version are ignored.
    pub schema_version: String,
    /// Upper bound on the number of entries kept in memory.
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            stale_time_ms: 5 * 60_000,
            cache_time_ms: 30 * 60_000,
            retry_count: 3,
            retry_delay_ms: 1_000,
            background_refetch_interval_ms: 5 * 60_000,
            schema_version: "1".to_string(),
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    /// Load a config from environment variables sharing `prefix`.
    ///
    /// # Environment Variables
    /// - `{PREFIX}_STALE_TIME_MS`
    /// - `{PREFIX}_CACHE_TIME_MS`
    /// - `{PREFIX}_RETRY_COUNT`
    /// - `{PREFIX}_RETRY_DELAY_MS`
    /// - `{PREFIX}_BACKGROUND_REFETCH_INTERVAL_MS`
    /// - `{PREFIX}_SCHEMA_VERSION`
    /// - `{PREFIX}_MAX_ENTRIES`
    ///
    /// Missing or unparsable values fall back to the defaults. The result is validated.
    pub fn from_env(prefix: &str) -> Result<Self, CacheError> {
        let defaults = Self::default();
        let config = CacheConfig {
            stale_time_ms: env_or(prefix, "STALE_TIME_MS", defaults.stale_time_ms),
            cache_time_ms: env_or(prefix, "CACHE_TIME_MS", defaults.cache_time_ms),
            retry_count: env_or(prefix, "RETRY_COUNT", defaults.retry_count),
            retry_delay_ms: env_or(prefix, "RETRY_DELAY_MS", defaults.retry_delay_ms),
            background_refetch_interval_ms: env_or(
                prefix,
                "BACKGROUND_REFETCH_INTERVAL_MS",
                defaults.background_refetch_interval_ms,
            ),
            schema_version: env::var(format!("{}_SCHEMA_VERSION", prefix))
                .unwrap_or(defaults.schema_version),
            max_entries: env_or(prefix, "MAX_ENTRIES", defaults.max_entries),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration invariants.
    ///
    /// `stale_time_ms < cache_time_ms` must hold, otherwise every stale entry would be
    /// expired at the same instant.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.stale_time_ms < 0 {
            return Err(CacheError::InvalidConfig(format!(
                "stale_time_ms must not be negative, got {}",
                self.stale_time_ms
            )));
        }
        if self.stale_time_ms >= self.cache_time_ms {
            return Err(CacheError::InvalidConfig(format!(
                "stale_time_ms ({}) must be lower than cache_time_ms ({})",
                self.stale_time_ms, self.cache_time_ms
            )));
        }
        if self.schema_version.is_empty() {
            return Err(CacheError::InvalidConfig(
                "schema_version must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn background_refetch_interval(&self) -> Option<Duration> {
        (self.background_refetch_interval_ms > 0)
            .then(|| Duration::from_millis(self.background_refetch_interval_ms))
    }
}

/// Configuration for the flat string store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FlatStoreConfig {
    /// Total bytes of keys and values the store accepts before reporting quota exhaustion.
    pub max_bytes: usize,
    /// Mirror the store to this JSON file so it survives restarts.
    pub path: Option<PathBuf>,
}

impl Default for FlatStoreConfig {
    fn default() -> Self {
        FlatStoreConfig {
            max_bytes: 5 * 1024 * 1024,
            path: None,
        }
    }
}

/// Selects and configures the persistent tier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Redis URL of the structured backend. `None` goes straight to the flat store.
    pub redis_url: Option<String>,
    /// TTL set on Redis keys. `None` keeps records until explicitly removed.
    pub redis_key_ttl_ms: Option<u64>,
    /// How long the capability probe waits for Redis.
    pub connect_timeout_ms: u64,
    pub flat: FlatStoreConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            redis_url: None,
            redis_key_ttl_ms: None,
            connect_timeout_ms: 2_000,
            flat: FlatStoreConfig::default(),
        }
    }
}

impl PersistenceConfig {
    /// Load from environment variables.
    ///
    /// # Environment Variables
    /// - `{PREFIX}_REDIS_URL`
    /// - `{PREFIX}_REDIS_KEY_TTL_MS`
    /// - `{PREFIX}_CONNECT_TIMEOUT_MS`
    /// - `{PREFIX}_FLAT_MAX_BYTES`
    /// - `{PREFIX}_FLAT_PATH`
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        PersistenceConfig {
            redis_url: env::var(format!("{}_REDIS_URL", prefix)).ok(),
            redis_key_ttl_ms: env::var(format!("{}_REDIS_KEY_TTL_MS", prefix))
                .ok()
                .and_then(|v| v.parse().ok()),
            connect_timeout_ms: env_or(prefix, "CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms),
            flat: FlatStoreConfig {
                max_bytes: env_or(prefix, "FLAT_MAX_BYTES", defaults.flat.max_bytes),
                path: env::var(format!("{}_FLAT_PATH", prefix))
                    .ok()
                    .map(PathBuf::from),
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn redis_key_ttl(&self) -> Option<Duration> {
        self.redis_key_ttl_ms.map(Duration::from_millis)
    }
}

fn env_or<V: FromStr>(prefix: &str, name: &str, default: V) -> V {
    env::var(format!("{}_{}", prefix, name))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
