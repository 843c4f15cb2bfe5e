use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// A cache entry containing a value and the metadata needed to judge it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub data: T,

    /// Unix timestamp in milliseconds of the write that produced this entry.
    pub timestamp: i64,

    /// Schema version of the configuration that wrote the entry.
    /// Persisted entries with a different version are ignored on load.
    pub schema_version: String,

    /// Hex SHA-256 digest of `data`, used to spot revalidations that changed nothing.
    pub content_hash: String,
}

/// How old an entry is relative to the cache's timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `age <= stale_time`
    Fresh,
    /// `stale_time < age <= cache_time`
    Stale,
    /// `age > cache_time`
    Expired,
}

impl Freshness {
    /// Classify an entry of the given age.
    pub fn classify(age_ms: i64, stale_time_ms: i64, cache_time_ms: i64) -> Self {
        if age_ms > cache_time_ms {
            Freshness::Expired
        } else if age_ms > stale_time_ms {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Stale and expired entries both need revalidation.
    pub fn needs_revalidation(self) -> bool {
        !matches!(self, Freshness::Fresh)
    }
}

impl<T> CacheEntry<T>
where
    T: Serialize,
{
    /// Create an entry stamped at `now_ms`, computing its content hash.
    pub fn new(data: T, now_ms: i64, schema_version: &str) -> Result<Self, CacheError> {
        let content_hash = content_hash(&data)?;
        Ok(CacheEntry {
            data,
            timestamp: now_ms,
            schema_version: schema_version.to_string(),
            content_hash,
        })
    }
}

impl<T> CacheEntry<T> {
    /// Milliseconds elapsed since the entry was written.
    pub fn age(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp
    }

    pub fn freshness(&self, now_ms: i64, stale_time_ms: i64, cache_time_ms: i64) -> Freshness {
        Freshness::classify(self.age(now_ms), stale_time_ms, cache_time_ms)
    }

    /// Check if the entry is still fresh.
    pub fn is_fresh(&self, now_ms: i64, stale_time_ms: i64) -> bool {
        self.age(now_ms) <= stale_time_ms
    }

    /// Check if the entry is stale. Expired entries are stale as well.
    pub fn is_stale(&self, now_ms: i64, stale_time_ms: i64) -> bool {
        self.age(now_ms) > stale_time_ms
    }

    /// Check if the entry has expired and should not be served as a hit.
    pub fn is_expired(&self, now_ms: i64, cache_time_ms: i64) -> bool {
        self.age(now_ms) > cache_time_ms
    }
}

/// Deterministic digest of a value.
///
/// The value is first converted to a `serde_json::Value`, whose objects are ordered maps,
/// so structurally equal values hash equally regardless of field insertion order.
pub fn content_hash<T: Serialize>(data: &T) -> Result<String, CacheError> {
    let canonical = serde_json::to_value(data)
        .and_then(|value| serde_json::to_vec(&value))
        .map_err(|e| CacheError::Serialization(format!("Hashing failed: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
