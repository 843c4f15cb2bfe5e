//! Storefront demo: product listings, product pages and store configuration cached by
//! three engines with different timings, sharing one persistent tier.
//!
//! Run with `RUST_LOG=swr_engine=debug` to watch revalidation. Set
//! `STOREFRONT_REDIS_URL` to persist into Redis instead of the flat store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use swr_engine::{
    CacheConfig, CacheError, CacheKey, CacheRegistryBuilder, FetchOptions, PersistenceConfig,
    PersistentStore, PlaceholderFallback, SilentFallback, SwrEngine,
};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Product {
    id: u64,
    name: String,
    price_cents: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoreSettings {
    name: String,
    currency: String,
}

fn sample_products() -> Vec<Product> {
    vec![Product {
        id: 0,
        name: "Sample product".into(),
        price_cents: 0,
    }]
}

/// Pretend API whose prices drift every call.
#[derive(Clone, Default)]
struct StoreApi {
    calls: Arc<AtomicU64>,
}

impl StoreApi {
    async fn list_products(&self, key: CacheKey) -> Result<Vec<Product>, CacheError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        println!("  [api] listing {} (call #{})", key, n + 1);
        Ok(vec![
            Product {
                id: 1,
                name: "Mug".into(),
                price_cents: 1_200 + n,
            },
            Product {
                id: 2,
                name: "Poster".into(),
                price_cents: 2_500,
            },
        ])
    }

    async fn product(&self, key: CacheKey) -> Result<Product, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::not_found(key.as_str()))
    }

    async fn settings(&self, _key: CacheKey) -> Result<StoreSettings, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StoreSettings {
            name: "Acme Goods".into(),
            currency: "EUR".into(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listing_config = CacheConfig {
        stale_time_ms: 500,
        cache_time_ms: 5_000,
        background_refetch_interval_ms: 1_000,
        ..CacheConfig::from_env("STOREFRONT_CACHE")?
    };
    let settings_config = CacheConfig {
        stale_time_ms: 60_000,
        cache_time_ms: 600_000,
        ..CacheConfig::from_env("STOREFRONT_CACHE")?
    };
    let persistence = PersistenceConfig::from_env("STOREFRONT");

    let listings: SwrEngine<Vec<Product>> = SwrEngine::builder("products", listing_config.clone())
        .persistent(
            PersistentStore::probe("products", &listing_config.schema_version, &persistence)
                .await?,
        )
        .fallback(PlaceholderFallback::new(sample_products()))
        .build()?;
    let products: SwrEngine<Product> = SwrEngine::new("product", listing_config.clone())?;
    let settings: SwrEngine<StoreSettings> = SwrEngine::builder("config", settings_config)
        .fallback(SilentFallback)
        .build()?;

    let registry = CacheRegistryBuilder::new()
        .add("products", listings)
        .add("product", products)
        .add("config", settings)
        .build();
    println!("Registered engines: {:?}", registry.names());
    registry.start_revalidation();

    let api = StoreApi::default();
    let listings = registry
        .engine::<Vec<Product>>("products")
        .ok_or("products engine missing")?;
    let key = CacheKey::products("acme");

    let _sub = listings.subscribe(&key, |update| {
        let prices: Vec<u64> = update
            .data
            .iter()
            .flatten()
            .map(|p| p.price_cents)
            .collect();
        println!(
            "  [subscriber] prices={:?} validating={} error={:?}",
            prices, update.is_validating, update.error
        );
    });

    println!("\n1. Cold fetch (blocks on the API)");
    let api_clone = api.clone();
    let loader = move |k: CacheKey| {
        let api = api_clone.clone();
        async move { api.list_products(k).await }
    };
    let first = listings.fetch(&key, loader.clone(), FetchOptions::default()).await?;
    println!("   -> {} products", first.data.len());

    println!("\n2. Fresh fetch (served from memory)");
    listings.fetch(&key, loader.clone(), FetchOptions::default()).await?;

    println!("\n3. Stale fetch (served immediately, revalidated in the background)");
    tokio::time::sleep(Duration::from_millis(700)).await;
    let stale = listings.fetch(&key, loader.clone(), FetchOptions::default()).await?;
    println!("   -> is_validating={}", stale.is_validating);
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\n4. Optimistic price edit");
    let mut edited = stale.data.clone();
    if let Some(mug) = edited.first_mut() {
        mug.price_cents = 999;
    }
    listings.mutate(&key, Some(edited), false).await?;

    println!("\n5. Missing product page");
    let product_engine = registry
        .engine::<Product>("product")
        .ok_or("product engine missing")?;
    let api_clone = api.clone();
    let result = product_engine
        .fetch(
            &CacheKey::product(404, "acme"),
            move |k| {
                let api = api_clone.clone();
                async move { api.product(k).await }
            },
            FetchOptions::default(),
        )
        .await;
    println!("   -> {:?}", result.err());

    println!("\n6. Store settings");
    let settings = registry
        .engine::<StoreSettings>("config")
        .ok_or("config engine missing")?;
    let api_clone = api.clone();
    let store = settings
        .fetch(
            &CacheKey::config("acme"),
            move |k| {
                let api = api_clone.clone();
                async move { api.settings(k).await }
            },
            FetchOptions::default(),
        )
        .await?;
    println!("   -> {} ({})", store.data.name, store.data.currency);

    println!("\n7. Background revalidation of the observed listing");
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    registry.shutdown();
    println!("\nAPI calls made: {}", api.calls.load(Ordering::SeqCst));
    Ok(())
}
