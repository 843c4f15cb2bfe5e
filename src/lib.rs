//! swr-engine - A stale-while-revalidate (SWR) data engine for Rust
//!
//! This library keeps remote data close to the code that renders it:
//! - Stale-while-revalidate reads classified by entry age
//! - A bounded in-memory tier backed by a durable tier (Redis or a flat string store)
//! - Deduplication of concurrent origin loads, with retry and exponential backoff
//! - Per-key subscriptions that receive every data, error and validating change
//! - Optimistic mutation and periodic revalidation of observed keys
//!
//! # Example
//!
//! ```ignore
//! use swr_engine::{CacheConfig, CacheKey, FetchOptions, SwrEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), swr_engine::CacheError> {
//!     let config = CacheConfig::from_env("STOREFRONT_CACHE")?;
//!     let products: SwrEngine<Vec<String>> = SwrEngine::new("products", config)?;
//!
//!     let key = CacheKey::products("acme");
//!     let _sub = products.subscribe(&key, |update| {
//!         println!("validating={} data={:?}", update.is_validating, update.data);
//!     });
//!
//!     // Fresh data is returned as is, stale data is returned and refreshed in the
//!     // background, expired or missing data is loaded before returning.
//!     let listing = products
//!         .fetch(&key, |key| async move {
//!             Ok(vec![format!("mug for {}", key)])
//!         }, FetchOptions::default())
//!         .await?;
//!     println!("{:?}", listing.data);
//!     Ok(())
//! }
//! ```

mod config;
mod coordinator;
mod engine;
mod entry;
mod error;
mod fallback;
mod key;
mod memory;
pub mod persistent;
mod registry;
mod revalidator;
mod subscribers;
mod utils;

// Re-export public API
pub use config::{CacheConfig, FlatStoreConfig, PersistenceConfig};
pub use coordinator::{RemoteFetch, RequestCoordinator, RetryPolicy, fetch_with_retry, remote_fetch};
pub use engine::{ClearScope, FetchOptions, Fetched, SwrEngine, SwrEngineBuilder, WeakEngine};
pub use entry::{CacheEntry, Freshness, content_hash};
pub use error::CacheError;
pub use fallback::{
    FallbackAction, FallbackPolicy, NotFoundFallback, PlaceholderFallback, SilentFallback,
};
pub use key::CacheKey;
pub use memory::{Lookup, MemoryCache};
pub use persistent::{
    FlatStringStore, MetricsBackend, MetricsSink, PersistenceMetric, PersistentBackend,
    PersistentStore, RedisBackend, RedisBackendConfig,
};
pub use registry::{CacheRegistry, CacheRegistryBuilder};
pub use revalidator::BackgroundRevalidator;
pub use subscribers::{Callback, SubscriberRegistry, Subscription, Update};
pub use utils::{Clock, ManualClock, SystemClock, build_cache_key, now_ms};
