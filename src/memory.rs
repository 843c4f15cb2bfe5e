use moka::future::Cache;
use moka::ops::compute::Op;
use serde::Serialize;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, Freshness};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::utils::Clock;

/// Outcome of a memory lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Fresh(CacheEntry<T>),
    Stale(CacheEntry<T>),
    /// The entry was expired and has just been evicted. It is handed back once so the
    /// caller can still fall back to it if the origin is unreachable.
    Expired(CacheEntry<T>),
    Missing,
}

impl<T> Lookup<T> {
    pub fn freshness(&self) -> Option<Freshness> {
        match self {
            Lookup::Fresh(_) => Some(Freshness::Fresh),
            Lookup::Stale(_) => Some(Freshness::Stale),
            Lookup::Expired(_) => Some(Freshness::Expired),
            Lookup::Missing => None,
        }
    }

    pub fn entry(&self) -> Option<&CacheEntry<T>> {
        match self {
            Lookup::Fresh(entry) | Lookup::Stale(entry) | Lookup::Expired(entry) => Some(entry),
            Lookup::Missing => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry<T>> {
        match self {
            Lookup::Fresh(entry) | Lookup::Stale(entry) | Lookup::Expired(entry) => Some(entry),
            Lookup::Missing => None,
        }
    }
}

/// Process-local map of cache key to entry.
///
/// Backed by Moka for bounded, lock-free concurrent access. Expiry follows the entry
/// timestamps and the configured `cache_time_ms`; Moka's own TTL is not used so that the
/// injected clock stays the only source of time. Never performs I/O.
pub struct MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: Cache<CacheKey, CacheEntry<T>>,
    clock: Arc<dyn Clock>,
    stale_time_ms: i64,
    cache_time_ms: i64,
    schema_version: String,
}

impl<T> MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        MemoryCache {
            cache: Cache::builder().max_capacity(config.max_entries).build(),
            clock,
            stale_time_ms: config.stale_time_ms,
            cache_time_ms: config.cache_time_ms,
            schema_version: config.schema_version.clone(),
        }
    }

    /// Classify the entry for `key`, evicting it if it has expired.
    pub async fn lookup(&self, key: &CacheKey) -> Lookup<T> {
        let Some(entry) = self.cache.get(key).await else {
            return Lookup::Missing;
        };

        let now = self.clock.now_ms();
        match entry.freshness(now, self.stale_time_ms, self.cache_time_ms) {
            Freshness::Fresh => Lookup::Fresh(entry),
            Freshness::Stale => Lookup::Stale(entry),
            Freshness::Expired => {
                self.evict_expired(key, &entry).await;
                Lookup::Expired(entry)
            }
        }
    }

    /// Remove `key` only if it still holds `expired`. A write that landed after the
    /// lookup read the entry is left alone.
    async fn evict_expired(&self, key: &CacheKey, expired: &CacheEntry<T>) {
        let timestamp = expired.timestamp;
        let content_hash = expired.content_hash.clone();
        self.cache
            .entry(key.clone())
            .and_compute_with(|current| {
                let op = match current {
                    Some(current)
                        if current.value().timestamp == timestamp
                            && current.value().content_hash == content_hash =>
                    {
                        Op::Remove
                    }
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
    }

    /// Return the entry if it is fresh or stale. Expired entries are evicted.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        match self.lookup(key).await {
            Lookup::Fresh(entry) | Lookup::Stale(entry) => Some(entry),
            Lookup::Expired(_) | Lookup::Missing => None,
        }
    }

    /// Return whatever is stored for `key` without judging or evicting it.
    pub async fn peek(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        self.cache.get(key).await
    }

    /// Store `data` stamped with the current time and return the new entry.
    pub async fn set(&self, key: &CacheKey, data: T) -> Result<CacheEntry<T>, CacheError>
    where
        T: Serialize,
    {
        let entry = CacheEntry::new(data, self.clock.now_ms(), &self.schema_version)?;
        self.cache.insert(key.clone(), entry.clone()).await;
        Ok(entry)
    }

    /// Store an existing entry as-is, keeping its timestamp.
    pub async fn insert_entry(&self, key: &CacheKey, entry: CacheEntry<T>) {
        self.cache.insert(key.clone(), entry).await;
    }

    /// Restamp an entry whose data did not change.
    pub async fn touch(&self, key: &CacheKey, mut entry: CacheEntry<T>) -> CacheEntry<T> {
        entry.timestamp = self.clock.now_ms();
        self.cache.insert(key.clone(), entry.clone()).await;
        entry
    }

    pub async fn delete(&self, key: &CacheKey) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Keys currently held, in no particular order.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.cache.iter().map(|(key, _)| (*key).clone()).collect()
    }
}
