//! Builder API for grouping engines of different resource types.
//!
//! An application usually caches several kinds of data (product listings, single
//! products, store configuration), each with its own type and timing. The registry keeps
//! them under one roof so they can be looked up by name and share one lifecycle for
//! background revalidation.

use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;
use std::sync::Arc;

use crate::engine::SwrEngine;
use crate::revalidator::BackgroundRevalidator;

type Arm = Box<dyn Fn(&BackgroundRevalidator) -> bool + Send + Sync>;

struct Registered {
    name: String,
    engine: Arc<dyn Any + Send + Sync>,
    revalidator: BackgroundRevalidator,
    arm: Arm,
}

/// Builder for [`CacheRegistry`].
///
/// # Example
///
/// ```ignore
/// let listings: SwrEngine<Vec<Product>> = SwrEngine::new("products", config.clone())?;
/// let settings: SwrEngine<StoreConfig> = SwrEngine::new("config", config)?;
///
/// let registry = CacheRegistryBuilder::new()
///     .add("products", listings)
///     .add("config", settings)
///     .build();
///
/// let settings = registry.engine::<StoreConfig>("config").unwrap();
/// registry.start_revalidation();
/// ```
#[derive(Default)]
pub struct CacheRegistryBuilder {
    engines: Vec<Registered>,
}

impl CacheRegistryBuilder {
    pub fn new() -> Self {
        CacheRegistryBuilder {
            engines: Vec::new(),
        }
    }

    /// Add an engine under `name`. A later engine with the same name replaces the earlier one.
    pub fn add<T>(mut self, name: &str, engine: SwrEngine<T>) -> Self
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        if let Some(pos) = self.engines.iter().position(|r| r.name == name) {
            tracing::warn!("Replacing engine registered as '{}'", name);
            self.engines.remove(pos);
        }

        let armed = engine.clone();
        self.engines.push(Registered {
            name: name.to_string(),
            engine: Arc::new(engine),
            revalidator: BackgroundRevalidator::new(),
            arm: Box::new(move |revalidator| revalidator.start(&armed)),
        });
        self
    }

    pub fn build(self) -> CacheRegistry {
        CacheRegistry {
            engines: self.engines,
        }
    }
}

/// Named engines of arbitrary resource types.
pub struct CacheRegistry {
    engines: Vec<Registered>,
}

impl CacheRegistry {
    /// The engine registered as `name`, if it caches values of type `T`.
    pub fn engine<T>(&self, name: &str) -> Option<SwrEngine<T>>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        self.engines
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.engine.downcast_ref::<SwrEngine<T>>())
            .cloned()
    }

    /// Registered names, in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.engines.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Start background revalidation for every engine whose interval is enabled.
    ///
    /// Returns how many revalidators are running.
    pub fn start_revalidation(&self) -> usize {
        let started = self
            .engines
            .iter()
            .filter(|r| (r.arm)(&r.revalidator))
            .count();
        tracing::info!(
            "Background revalidation running for {}/{} engine(s)",
            started,
            self.engines.len()
        );
        started
    }

    /// Stop every background revalidator. Cached data and subscriptions are kept.
    pub fn shutdown(&self) {
        for registered in &self.engines {
            registered.revalidator.stop();
        }
    }

    pub fn is_revalidating(&self, name: &str) -> bool {
        self.engines
            .iter()
            .find(|r| r.name == name)
            .is_some_and(|r| r.revalidator.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::engine::FetchOptions;
    use crate::key::CacheKey;

    fn config(interval_ms: u64) -> CacheConfig {
        CacheConfig {
            background_refetch_interval_ms: interval_ms,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_typed_lookup() {
        let listings: SwrEngine<Vec<String>> = SwrEngine::new("products", config(0)).unwrap();
        let settings: SwrEngine<u32> = SwrEngine::new("config", config(0)).unwrap();

        let registry = CacheRegistryBuilder::new()
            .add("products", listings)
            .add("config", settings)
            .build();

        assert_eq!(registry.names(), vec!["products", "config"]);
        assert!(registry.engine::<u32>("config").is_some());
        assert!(registry.engine::<String>("config").is_none());
        assert!(registry.engine::<u32>("missing").is_none());

        // Lookups return handles to the same engine.
        let key = CacheKey::config("acme");
        let first = registry.engine::<u32>("config").unwrap();
        first
            .fetch(&key, |_| async { Ok(3u32) }, FetchOptions::default())
            .await
            .unwrap();
        let second = registry.engine::<u32>("config").unwrap();
        assert_eq!(second.peek(&key).await.unwrap().data, 3);
    }

    #[tokio::test]
    async fn test_same_name_replaces() {
        let registry = CacheRegistryBuilder::new()
            .add("config", SwrEngine::<u32>::new("config", config(0)).unwrap())
            .add("config", SwrEngine::<String>::new("config", config(0)).unwrap())
            .build();

        assert_eq!(registry.len(), 1);
        assert!(registry.engine::<String>("config").is_some());
        assert!(registry.engine::<u32>("config").is_none());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let registry = CacheRegistryBuilder::new()
            .add("products", SwrEngine::<u32>::new("products", config(50)).unwrap())
            .add("config", SwrEngine::<u32>::new("config", config(0)).unwrap())
            .build();

        assert_eq!(registry.start_revalidation(), 1);
        assert!(registry.is_revalidating("products"));
        assert!(!registry.is_revalidating("config"));

        registry.shutdown();
        assert!(!registry.is_revalidating("products"));
    }
}
