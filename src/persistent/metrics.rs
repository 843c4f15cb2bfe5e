//! Metrics middleware for persistent backends.
//!
//! `MetricsBackend` wraps any [`PersistentBackend`] and emits a metric for every load,
//! save, remove and purge to a user-provided sink.
//!
//! # Example
//!
//! ```ignore
//! let flat = Arc::new(FlatStringStore::new(FlatStoreConfig::default())?);
//! let backend: Arc<dyn PersistentBackend> =
//!     Arc::new(MetricsBackend::new(flat, Arc::new(MyMetricsSink::new())));
//! let store = PersistentStore::new(backend, "products", "1");
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::error::CacheError;
use crate::persistent::PersistentBackend;

/// Metrics emitted by the MetricsBackend wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceMetric {
    /// Emitted on every load.
    Load {
        key: String,
        /// Whether a record was found.
        hit: bool,
        /// Whether the backend call failed.
        failed: bool,
        latency_ms: f64,
        tier: String,
        namespace: String,
    },
    /// Emitted on every save.
    Save {
        key: String,
        /// Size of the record in bytes.
        bytes: usize,
        /// Whether the save ran into the backend's quota.
        quota_exceeded: bool,
        failed: bool,
        latency_ms: f64,
        tier: String,
        namespace: String,
    },
    /// Emitted on every remove.
    Remove {
        key_count: usize,
        /// First key in the batch (for debugging/identification).
        first_key: Option<String>,
        latency_ms: f64,
        tier: String,
        namespace: String,
    },
    /// Emitted on every purge.
    Purge {
        /// Records dropped, `None` if the purge failed.
        removed: Option<usize>,
        latency_ms: f64,
        tier: String,
        namespace: String,
    },
}

/// Trait for receiving persistence metrics.
///
/// `emit` is called synchronously in the hot path; implementations should buffer.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn emit(&self, metric: PersistenceMetric);

    /// Flush any buffered metrics, typically at shutdown or on a timer.
    async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A backend wrapper that emits metrics for all operations.
pub struct MetricsBackend {
    inner: Arc<dyn PersistentBackend>,
    sink: Arc<dyn MetricsSink>,
    tier_name: String,
}

impl MetricsBackend {
    pub fn new(inner: Arc<dyn PersistentBackend>, sink: Arc<dyn MetricsSink>) -> Self {
        let tier_name = inner.name().to_string();
        MetricsBackend {
            inner,
            sink,
            tier_name,
        }
    }

    /// Get a reference to the metrics sink.
    pub fn sink(&self) -> &Arc<dyn MetricsSink> {
        &self.sink
    }

    fn elapsed_ms(start: Instant) -> f64 {
        start.elapsed().as_secs_f64() * 1000.0
    }
}

#[async_trait]
impl PersistentBackend for MetricsBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn load(&self, namespace: &str, key: &str) -> Result<Option<String>, CacheError> {
        let start = Instant::now();
        let result = self.inner.load(namespace, key).await;
        let latency_ms = Self::elapsed_ms(start);

        self.sink.emit(PersistenceMetric::Load {
            key: key.to_string(),
            hit: matches!(result, Ok(Some(_))),
            failed: result.is_err(),
            latency_ms,
            tier: self.tier_name.clone(),
            namespace: namespace.to_string(),
        });

        result
    }

    async fn save(&self, namespace: &str, key: &str, record: String) -> Result<(), CacheError> {
        let bytes = record.len();
        let start = Instant::now();
        let result = self.inner.save(namespace, key, record).await;
        let latency_ms = Self::elapsed_ms(start);

        self.sink.emit(PersistenceMetric::Save {
            key: key.to_string(),
            bytes,
            quota_exceeded: matches!(result, Err(CacheError::QuotaExceeded { .. })),
            failed: result.is_err(),
            latency_ms,
            tier: self.tier_name.clone(),
            namespace: namespace.to_string(),
        });

        result
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.remove(namespace, keys).await;
        let latency_ms = Self::elapsed_ms(start);

        self.sink.emit(PersistenceMetric::Remove {
            key_count: keys.len(),
            first_key: keys.first().map(|k| k.to_string()),
            latency_ms,
            tier: self.tier_name.clone(),
            namespace: namespace.to_string(),
        });

        result
    }

    async fn purge(&self, namespace: &str) -> Result<usize, CacheError> {
        let start = Instant::now();
        let result = self.inner.purge(namespace).await;
        let latency_ms = Self::elapsed_ms(start);

        self.sink.emit(PersistenceMetric::Purge {
            removed: result.as_ref().ok().copied(),
            latency_ms,
            tier: self.tier_name.clone(),
            namespace: namespace.to_string(),
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlatStoreConfig;
    use crate::persistent::FlatStringStore;
    use std::sync::Mutex;

    struct TestSink {
        metrics: Mutex<Vec<PersistenceMetric>>,
    }

    impl TestSink {
        fn new() -> Self {
            TestSink {
                metrics: Mutex::new(Vec::new()),
            }
        }

        fn take_metrics(&self) -> Vec<PersistenceMetric> {
            std::mem::take(&mut *self.metrics.lock().unwrap())
        }
    }

    #[async_trait]
    impl MetricsSink for TestSink {
        fn emit(&self, metric: PersistenceMetric) {
            self.metrics.lock().unwrap().push(metric);
        }

        async fn flush(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn flat(max_bytes: usize) -> Arc<dyn PersistentBackend> {
        Arc::new(
            FlatStringStore::new(FlatStoreConfig {
                max_bytes,
                path: None,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_load_miss_and_hit() {
        let sink = Arc::new(TestSink::new());
        let backend = MetricsBackend::new(flat(1024), sink.clone());

        backend.load("products", "k").await.unwrap();
        backend.save("products", "k", "v".to_string()).await.unwrap();
        sink.take_metrics();
        backend.load("products", "k").await.unwrap();

        match &sink.take_metrics()[..] {
            [PersistenceMetric::Load {
                key,
                hit,
                failed,
                tier,
                namespace,
                latency_ms,
            }] => {
                assert_eq!(key, "k");
                assert!(hit);
                assert!(!failed);
                assert_eq!(tier, "flat");
                assert_eq!(namespace, "products");
                assert!(*latency_ms >= 0.0);
            }
            other => panic!("Expected one Load metric, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_reports_quota_exhaustion() {
        let sink = Arc::new(TestSink::new());
        let backend = MetricsBackend::new(flat(8), sink.clone());

        let result = backend.save("ns", "k", "x".repeat(32)).await;
        assert!(result.is_err());

        match &sink.take_metrics()[..] {
            [PersistenceMetric::Save {
                bytes,
                quota_exceeded,
                failed,
                ..
            }] => {
                assert_eq!(*bytes, 32);
                assert!(quota_exceeded);
                assert!(failed);
            }
            other => panic!("Expected one Save metric, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_and_purge_metrics() {
        let sink = Arc::new(TestSink::new());
        let backend = MetricsBackend::new(flat(1024), sink.clone());
        backend.save("ns", "a", "1".to_string()).await.unwrap();
        sink.take_metrics();

        backend.remove("ns", &["a", "b"]).await.unwrap();
        backend.purge("ns").await.unwrap();

        let metrics = sink.take_metrics();
        assert_eq!(metrics.len(), 2);
        assert!(matches!(
            &metrics[0],
            PersistenceMetric::Remove { key_count: 2, first_key: Some(k), .. } if k == "a"
        ));
        assert!(matches!(
            &metrics[1],
            PersistenceMetric::Purge { removed: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn test_name_is_delegated() {
        let sink = Arc::new(TestSink::new());
        let backend = MetricsBackend::new(flat(16), sink);
        assert_eq!(backend.name(), "flat");
    }
}
