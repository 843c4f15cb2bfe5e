use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use swr_engine::{CacheError, CacheKey};

/// Product listing entry used as the cached value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchProduct {
    pub id: u64,
    pub name: String,
    pub price_cents: u64,
}

impl BenchProduct {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("Product {}", id),
            price_cents: 100 + (id % 10_000),
        }
    }
}

/// Simulated catalog API with configurable latency
#[derive(Clone)]
pub struct FakeCatalog {
    listing_size: usize,
    latency_ms: u64,
    request_count: Arc<AtomicUsize>,
}

impl FakeCatalog {
    pub fn new(listing_size: usize, latency_ms: u64) -> Self {
        Self {
            listing_size,
            latency_ms,
            request_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn list(&self, key: CacheKey) -> Result<Vec<BenchProduct>, CacheError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        // Simulate network latency
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;

        let seed = key.as_str().len() as u64;
        Ok((0..self.listing_size as u64)
            .map(|i| BenchProduct::new(seed * 1_000 + i))
            .collect())
    }

    #[allow(dead_code)]
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn reset_count(&self) {
        self.request_count.store(0, Ordering::Relaxed);
    }
}

/// Generate store keys for different workload patterns
pub struct KeyGenerator {
    num_stores: usize,
}

impl KeyGenerator {
    pub fn new(num_stores: usize) -> Self {
        Self { num_stores }
    }

    /// One listing key per store, in order
    pub fn sequential(&self) -> Vec<CacheKey> {
        (0..self.num_stores)
            .map(|i| CacheKey::products(&format!("store{}", i)))
            .collect()
    }

    /// Keys where `hot_ratio` of requests go to the first 20% of stores
    pub fn mixed(&self, hot_ratio: f64) -> Vec<CacheKey> {
        let mut rng = rand::thread_rng();
        let hot_count = (self.num_stores / 5).max(1);

        (0..self.num_stores)
            .map(|_| {
                let store = if rng.gen_bool(hot_ratio) {
                    rng.gen_range(0..hot_count)
                } else {
                    rng.gen_range(hot_count..self.num_stores.max(hot_count + 1))
                };
                CacheKey::products(&format!("store{}", store))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_key_generator() {
        use super::KeyGenerator;

        let key_gen = KeyGenerator::new(100);

        let seq = key_gen.sequential();
        assert_eq!(seq.len(), 100);
        assert_eq!(seq[0].as_str(), "products_store0");

        let mixed = key_gen.mixed(0.8);
        assert_eq!(mixed.len(), 100);
    }
}
