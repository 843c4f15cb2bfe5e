//! Durable tier behind the memory cache.
//!
//! A [`PersistentBackend`] stores opaque JSON records by namespace and key. The
//! [`PersistentStore`] on top of it owns the record format: it serializes entries, drops
//! records written under another schema version, and absorbs every backend failure so that
//! persistence can only ever degrade to memory-only operation.

pub mod flat;
pub mod metrics;
pub mod redis;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

use crate::config::PersistenceConfig;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::key::CacheKey;

pub use flat::FlatStringStore;
pub use metrics::{MetricsBackend, MetricsSink, PersistenceMetric};
pub use redis::{RedisBackend, RedisBackendConfig};

/// A durable key-value backend for serialized cache entries.
///
/// Every call may fail independently; callers must not assume that a failed save leaves
/// the backend unusable.
#[async_trait]
pub trait PersistentBackend: Send + Sync {
    /// A name for logs and metrics.
    ///
    /// # Example
    /// - "redis"
    /// - "flat"
    fn name(&self) -> &'static str;

    /// Return the stored record. `None` for misses.
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a record, replacing any previous one.
    ///
    /// Backends with a size limit return [`CacheError::QuotaExceeded`] when the record does
    /// not fit.
    async fn save(&self, namespace: &str, key: &str, record: String) -> Result<(), CacheError>;

    /// Removes the key(s) from the backend.
    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError>;

    /// Remove every record of `namespace`, returning how many were dropped.
    async fn purge(&self, namespace: &str) -> Result<usize, CacheError>;
}

/// Typed, best-effort view of a backend for one namespace.
#[derive(Clone)]
pub struct PersistentStore {
    backend: Arc<dyn PersistentBackend>,
    namespace: String,
    schema_version: String,
}

impl PersistentStore {
    pub fn new(
        backend: Arc<dyn PersistentBackend>,
        namespace: &str,
        schema_version: &str,
    ) -> Self {
        PersistentStore {
            backend,
            namespace: namespace.to_string(),
            schema_version: schema_version.to_string(),
        }
    }

    /// Pick a backend by probing what is available.
    ///
    /// Redis is used when a URL is configured and a connection succeeds within the
    /// configured timeout. Otherwise the flat string store is used.
    pub async fn probe(
        namespace: &str,
        schema_version: &str,
        config: &PersistenceConfig,
    ) -> Result<Self, CacheError> {
        if let Some(url) = &config.redis_url {
            let redis_config = RedisBackendConfig {
                url: url.clone(),
                key_ttl: config.redis_key_ttl(),
            };
            match tokio::time::timeout(config.connect_timeout(), RedisBackend::new(redis_config))
                .await
            {
                Ok(Ok(backend)) => {
                    tracing::info!("Persistent tier: redis, namespace={}", namespace);
                    return Ok(Self::new(Arc::new(backend), namespace, schema_version));
                }
                Ok(Err(e)) => {
                    tracing::warn!("Redis unavailable, falling back to flat store: {}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Redis connection timed out after {:?}, falling back to flat store",
                        config.connect_timeout()
                    );
                }
            }
        }

        let flat = FlatStringStore::new(config.flat.clone())?;
        tracing::info!("Persistent tier: flat, namespace={}", namespace);
        Ok(Self::new(Arc::new(flat), namespace, schema_version))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Load the entry for `key`.
    ///
    /// Records of another schema version, records that no longer deserialize, and backend
    /// failures all read as absent.
    pub async fn load<T>(&self, key: &CacheKey) -> Option<CacheEntry<T>>
    where
        T: DeserializeOwned,
    {
        let record = match self.backend.load(&self.namespace, key.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(
                    "Persistent load failed: tier={}, key={}, error={}",
                    self.backend.name(),
                    key,
                    e
                );
                return None;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&record) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Dropping unreadable record: key={}, error={}", key, e);
                return None;
            }
        };

        let version = value.get("schema_version").and_then(|v| v.as_str());
        if version != Some(self.schema_version.as_str()) {
            tracing::debug!(
                "Ignoring record with schema version {:?} (expected {}): key={}",
                version,
                self.schema_version,
                key
            );
            return None;
        }

        match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Dropping record that no longer fits: key={}, error={}", key, e);
                None
            }
        }
    }

    /// Save an entry. Failures are logged and swallowed.
    ///
    /// When the backend reports quota exhaustion the namespace is purged and the write is
    /// attempted once more.
    pub async fn save<T>(&self, key: &CacheKey, entry: &CacheEntry<T>)
    where
        T: Serialize,
    {
        let record = match serde_json::to_string(entry) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping persistence, serialization failed: key={}, error={}", key, e);
                return;
            }
        };

        match self
            .backend
            .save(&self.namespace, key.as_str(), record.clone())
            .await
        {
            Ok(()) => {}
            Err(CacheError::QuotaExceeded { .. }) => {
                tracing::warn!(
                    "Quota exceeded on tier={}, purging namespace={}",
                    self.backend.name(),
                    self.namespace
                );
                if let Err(e) = self.backend.purge(&self.namespace).await {
                    tracing::warn!("Purge failed: namespace={}, error={}", self.namespace, e);
                    return;
                }
                if let Err(e) = self.backend.save(&self.namespace, key.as_str(), record).await {
                    tracing::warn!(
                        "Persistent save failed after purge: key={}, error={}",
                        key,
                        e
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Persistent save failed: tier={}, key={}, error={}",
                    self.backend.name(),
                    key,
                    e
                );
            }
        }
    }

    /// Remove the entry for `key`. Failures are logged and swallowed.
    pub async fn remove(&self, key: &CacheKey) {
        if let Err(e) = self.backend.remove(&self.namespace, &[key.as_str()]).await {
            tracing::warn!(
                "Persistent remove failed: tier={}, key={}, error={}",
                self.backend.name(),
                key,
                e
            );
        }
    }

    /// Remove every entry of this namespace. Failures are logged and swallowed.
    pub async fn purge(&self) {
        match self.backend.purge(&self.namespace).await {
            Ok(removed) => {
                tracing::debug!("Purged {} records: namespace={}", removed, self.namespace)
            }
            Err(e) => tracing::warn!("Purge failed: namespace={}, error={}", self.namespace, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlatStoreConfig;

    fn flat(max_bytes: usize) -> Arc<FlatStringStore> {
        Arc::new(
            FlatStringStore::new(FlatStoreConfig {
                max_bytes,
                path: None,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = PersistentStore::new(flat(1024 * 1024), "products", "1");
        let key = CacheKey::products("acme");
        let entry = CacheEntry::new(vec!["mug".to_string()], 10, "1").unwrap();

        store.save(&key, &entry).await;
        let loaded: Option<CacheEntry<Vec<String>>> = store.load(&key).await;
        assert_eq!(loaded, Some(entry));

        store.remove(&key).await;
        let loaded: Option<CacheEntry<Vec<String>>> = store.load(&key).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_schema_mismatch_reads_as_absent() {
        let backend = flat(1024 * 1024);
        let old = PersistentStore::new(backend.clone(), "config", "1");
        let new = PersistentStore::new(backend, "config", "2");
        let key = CacheKey::config("acme");

        old.save(&key, &CacheEntry::new(5u32, 0, "1").unwrap()).await;

        let loaded: Option<CacheEntry<u32>> = new.load(&key).await;
        assert!(loaded.is_none());
        let loaded: Option<CacheEntry<u32>> = old.load(&key).await;
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_undeserializable_record_reads_as_absent() {
        let store = PersistentStore::new(flat(1024 * 1024), "products", "1");
        let key = CacheKey::products("acme");
        store
            .save(&key, &CacheEntry::new("text".to_string(), 0, "1").unwrap())
            .await;

        let loaded: Option<CacheEntry<u64>> = store.load(&key).await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_quota_exhaustion_purges_namespace_and_retries() {
        let backend = flat(400);
        let store = PersistentStore::new(backend.clone(), "products", "1");

        let first = CacheKey::products("first");
        let second = CacheKey::products("second");
        let big = "x".repeat(150);

        store
            .save(&first, &CacheEntry::new(big.clone(), 0, "1").unwrap())
            .await;
        store
            .save(&second, &CacheEntry::new(big, 0, "1").unwrap())
            .await;

        // The second write only fits after the first one was purged.
        let first_loaded: Option<CacheEntry<String>> = store.load(&first).await;
        let second_loaded: Option<CacheEntry<String>> = store.load(&second).await;
        assert!(first_loaded.is_none());
        assert!(second_loaded.is_some());
    }

    #[tokio::test]
    async fn test_probe_without_redis_uses_flat_store() {
        let store = PersistentStore::probe("products", "1", &PersistenceConfig::default())
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "flat");
    }

    #[tokio::test]
    async fn test_probe_falls_back_when_redis_is_unreachable() {
        let config = PersistenceConfig {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            connect_timeout_ms: 500,
            ..PersistenceConfig::default()
        };
        let store = PersistentStore::probe("products", "1", &config).await.unwrap();
        assert_eq!(store.backend_name(), "flat");
    }
}
