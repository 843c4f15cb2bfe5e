use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::config::FlatStoreConfig;
use crate::error::CacheError;
use crate::persistent::PersistentBackend;
use crate::utils::build_cache_key;

/// Flat string-keyed store with a byte quota.
///
/// The map itself lives behind a short-lived lock. The store counts the bytes of every key
/// and record it holds; a write that would exceed `max_bytes` fails with
/// [`CacheError::QuotaExceeded`] and leaves the store unchanged, so the caller can purge and
/// retry.
///
/// With a `path` configured, the whole map is mirrored to a JSON file after every change
/// and reloaded on construction. Snapshots are taken under the lock and numbered; the file
/// is written after the lock is released and never goes back to an older snapshot.
pub struct FlatStringStore {
    state: Mutex<HashMap<String, String>>,
    config: FlatStoreConfig,
    generation: AtomicU64,
    /// Generation of the snapshot last written to the mirror file.
    written: tokio::sync::Mutex<u64>,
}

/// Serialized copy of the map, tagged with the change that produced it.
struct Snapshot {
    generation: u64,
    raw: String,
}

impl FlatStringStore {
    /// Create the store, reading the mirror file if one is configured and present.
    pub fn new(config: FlatStoreConfig) -> Result<Self, CacheError> {
        let mut records = HashMap::new();

        if let Some(path) = &config.path
            && path.exists()
        {
            let raw = fs::read_to_string(path).map_err(|e| {
                CacheError::persistence("flat", "", format!("Failed to read {:?}: {}", path, e))
            })?;
            match serde_json::from_str(&raw) {
                Ok(loaded) => records = loaded,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable flat store file {:?}: {}", path, e);
                }
            }
        }

        Ok(FlatStringStore {
            state: Mutex::new(records),
            config,
            generation: AtomicU64::new(0),
            written: tokio::sync::Mutex::new(0),
        })
    }

    /// Bytes currently used by keys and records.
    pub fn used_bytes(&self) -> usize {
        Self::size_of(&self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn size_of(records: &HashMap<String, String>) -> usize {
        records.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Capture the map after a change. Must be called with the state lock held.
    fn snapshot(&self, records: &HashMap<String, String>) -> Result<Option<Snapshot>, CacheError> {
        if self.config.path.is_none() {
            return Ok(None);
        }
        let raw = serde_json::to_string(records)
            .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(Snapshot { generation, raw }))
    }

    async fn write_mirror(&self, snapshot: Option<Snapshot>) -> Result<(), CacheError> {
        let (Some(path), Some(snapshot)) = (&self.config.path, snapshot) else {
            return Ok(());
        };

        let mut written = self.written.lock().await;
        if snapshot.generation <= *written {
            tracing::trace!(
                "Skipping superseded flat store snapshot: generation={}",
                snapshot.generation
            );
            return Ok(());
        }
        tokio::fs::write(path, snapshot.raw).await.map_err(|e| {
            CacheError::persistence("flat", "", format!("Failed to write {:?}: {}", path, e))
        })?;
        *written = snapshot.generation;
        Ok(())
    }
}

#[async_trait]
impl PersistentBackend for FlatStringStore {
    fn name(&self) -> &'static str {
        "flat"
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Option<String>, CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        Ok(self.lock().get(&cache_key).cloned())
    }

    async fn save(&self, namespace: &str, key: &str, record: String) -> Result<(), CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let snapshot = {
            let mut state = self.lock();

            let replaced = state
                .get(&cache_key)
                .map(|old| cache_key.len() + old.len())
                .unwrap_or(0);
            let needed = Self::size_of(&state) - replaced + cache_key.len() + record.len();
            if needed > self.config.max_bytes {
                return Err(CacheError::quota_exceeded("flat", key));
            }

            state.insert(cache_key, record);
            self.snapshot(&state)?
        };
        self.write_mirror(snapshot).await
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        let snapshot = {
            let mut state = self.lock();
            for key in keys {
                state.remove(&build_cache_key(&namespace, key));
            }
            self.snapshot(&state)?
        };
        self.write_mirror(snapshot).await
    }

    async fn purge(&self, namespace: &str) -> Result<usize, CacheError> {
        let prefix = build_cache_key(&namespace, "");
        let (removed, snapshot) = {
            let mut state = self.lock();
            let before = state.len();
            state.retain(|k, _| !k.starts_with(&prefix));
            (before - state.len(), self.snapshot(&state)?)
        };
        self.write_mirror(snapshot).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    fn store(max_bytes: usize) -> FlatStringStore {
        FlatStringStore::new(FlatStoreConfig {
            max_bytes,
            path: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_save_remove() {
        let store = store(1024);

        assert!(store.load("products", "k").await.unwrap().is_none());

        store.save("products", "k", "v".to_string()).await.unwrap();
        assert_eq!(store.load("products", "k").await.unwrap().as_deref(), Some("v"));

        store.remove("products", &["k"]).await.unwrap();
        assert!(store.load("products", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_store_unchanged() {
        let store = store(32);
        store.save("ns", "a", "1234".to_string()).await.unwrap();
        let used = store.used_bytes();

        let err = store
            .save("ns", "b", "x".repeat(64))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { .. }));
        assert_eq!(store.used_bytes(), used);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_double_count() {
        let store = store(20);
        // "ns::a" is 5 bytes, leaving room for a 15 byte record.
        store.save("ns", "a", "x".repeat(15)).await.unwrap();
        store.save("ns", "a", "y".repeat(15)).await.unwrap();
        assert_eq!(store.used_bytes(), 20);
    }

    #[tokio::test]
    async fn test_purge_only_touches_its_namespace() {
        let store = store(1024);
        store.save("products", "a", "1".to_string()).await.unwrap();
        store.save("products", "b", "2".to_string()).await.unwrap();
        store.save("config", "a", "3".to_string()).await.unwrap();

        assert_eq!(store.purge("products").await.unwrap(), 2);
        assert!(store.load("products", "a").await.unwrap().is_none());
        assert_eq!(store.load("config", "a").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_mirror_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlatStoreConfig {
            max_bytes: 1024,
            path: Some(dir.path().join("swr.json")),
        };

        let store = FlatStringStore::new(config.clone()).unwrap();
        store.save("config", "acme", "{}".to_string()).await.unwrap();
        drop(store);

        let reopened = FlatStringStore::new(config).unwrap();
        assert_eq!(
            reopened.load("config", "acme").await.unwrap().as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn test_concurrent_saves_reach_the_mirror_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlatStoreConfig {
            max_bytes: 64 * 1024,
            path: Some(dir.path().join("swr.json")),
        };
        let store = FlatStringStore::new(config.clone()).unwrap();

        let keys: Vec<String> = (0..20).map(|i| format!("store-{}", i)).collect();
        let results = join_all(
            keys.iter()
                .map(|key| store.save("products", key, format!("\"{}\"", key))),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));
        drop(store);

        // The last snapshot written holds every record.
        let reopened = FlatStringStore::new(config).unwrap();
        assert_eq!(reopened.len(), 20);
        assert_eq!(
            reopened.load("products", "store-7").await.unwrap().as_deref(),
            Some("\"store-7\"")
        );
    }
}
