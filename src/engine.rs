use futures::future::join_all;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use crate::config::CacheConfig;
use crate::coordinator::{RemoteFetch, RequestCoordinator, RetryPolicy, fetch_with_retry, remote_fetch};
use crate::entry::{CacheEntry, Freshness, content_hash};
use crate::error::CacheError;
use crate::fallback::{FallbackAction, FallbackPolicy, NotFoundFallback};
use crate::key::CacheKey;
use crate::memory::{Lookup, MemoryCache};
use crate::persistent::{PersistentBackend, PersistentStore};
use crate::subscribers::{SubscriberRegistry, Subscription, Update};
use crate::utils::{Clock, SystemClock};

/// Options for [`SwrEngine::fetch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Go to the origin regardless of freshness.
    pub force_refresh: bool,
    /// Do not announce the fetch to subscribers before it completes.
    pub silent: bool,
}

impl FetchOptions {
    pub fn force() -> Self {
        FetchOptions {
            force_refresh: true,
            silent: false,
        }
    }

    pub fn silent() -> Self {
        FetchOptions {
            force_refresh: false,
            silent: true,
        }
    }
}

/// The value a fetch resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data: T,
    /// Set when the origin failed and `data` is the last known value.
    pub error: Option<CacheError>,
    /// Set when `data` is stale and a revalidation is running in the background.
    pub is_validating: bool,
}

impl<T> Fetched<T> {
    fn settled(data: T) -> Self {
        Fetched {
            data,
            error: None,
            is_validating: false,
        }
    }
}

/// What [`SwrEngine::clear_cache`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    Key(CacheKey),
    All,
}

impl From<CacheKey> for ClearScope {
    fn from(key: CacheKey) -> Self {
        ClearScope::Key(key)
    }
}

/// How a revalidation talks to subscribers.
#[derive(Debug, Clone, Copy)]
struct Revalidation {
    force: bool,
    /// Send `(prior, None, true)` before going to the origin.
    announce: bool,
    /// A validating update was already sent by whoever started this revalidation.
    announced: bool,
}

impl Revalidation {
    fn blocking(opts: FetchOptions) -> Self {
        Revalidation {
            force: opts.force_refresh,
            announce: !opts.silent,
            announced: false,
        }
    }

    fn quiet() -> Self {
        Revalidation {
            force: false,
            announce: false,
            announced: false,
        }
    }

    fn after_announcement() -> Self {
        Revalidation {
            force: false,
            announce: false,
            announced: true,
        }
    }

    /// Unchanged data only needs to reach subscribers to close a validating update.
    fn notify_unchanged(&self) -> bool {
        self.announce || self.announced
    }
}

struct EngineState<T>
where
    T: Clone + Send + Sync + 'static,
{
    namespace: String,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    memory: MemoryCache<T>,
    persistent: Option<PersistentStore>,
    coordinator: RequestCoordinator<Fetched<T>>,
    subscribers: SubscriberRegistry<T>,
    fetchers: RwLock<HashMap<CacheKey, RemoteFetch<T>>>,
    fallback: Arc<dyn FallbackPolicy<T>>,
}

/// Stale-while-revalidate engine for one resource type.
///
/// Reads are served from memory, hydrated from the persistent tier on a miss, and
/// revalidated against the origin according to the entry's age:
/// - fresh: returned as is
/// - stale: returned immediately, revalidated in the background
/// - expired or missing: loaded from the origin before returning
///
/// Concurrent origin loads of one key are coalesced, and every state change is pushed to
/// the key's subscribers as an [`Update`]. Cloning is cheap and clones share all state.
pub struct SwrEngine<T>
where
    T: Clone + Send + Sync + 'static,
{
    state: Arc<EngineState<T>>,
}

impl<T> Clone for SwrEngine<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        SwrEngine {
            state: Arc::clone(&self.state),
        }
    }
}

/// A handle that does not keep the engine alive.
pub struct WeakEngine<T>
where
    T: Clone + Send + Sync + 'static,
{
    state: Weak<EngineState<T>>,
}

impl<T> WeakEngine<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn upgrade(&self) -> Option<SwrEngine<T>> {
        self.state.upgrade().map(|state| SwrEngine { state })
    }
}

/// Builder for [`SwrEngine`].
pub struct SwrEngineBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    namespace: String,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    persistent: Option<PersistentStore>,
    fallback: Arc<dyn FallbackPolicy<T>>,
}

impl<T> SwrEngineBuilder<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Use another clock than the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist entries to `backend` under this engine's namespace and schema version.
    pub fn backend(mut self, backend: Arc<dyn PersistentBackend>) -> Self {
        self.persistent = Some(PersistentStore::new(
            backend,
            &self.namespace,
            &self.config.schema_version,
        ));
        self
    }

    /// Persist entries through an already configured store, e.g. one returned by
    /// [`PersistentStore::probe`].
    pub fn persistent(mut self, store: PersistentStore) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Policy for failed fetches with nothing cached. Defaults to [`NotFoundFallback`].
    pub fn fallback(mut self, policy: impl FallbackPolicy<T> + 'static) -> Self {
        self.fallback = Arc::new(policy);
        self
    }

    pub fn build(self) -> Result<SwrEngine<T>, CacheError> {
        self.config.validate()?;

        let memory = MemoryCache::new(&self.config, self.clock.clone());
        let coordinator = RequestCoordinator::new(RetryPolicy::from_config(&self.config));

        Ok(SwrEngine {
            state: Arc::new(EngineState {
                namespace: self.namespace,
                config: self.config,
                clock: self.clock,
                memory,
                persistent: self.persistent,
                coordinator,
                subscribers: SubscriberRegistry::new(),
                fetchers: RwLock::new(HashMap::new()),
                fallback: self.fallback,
            }),
        })
    }
}

impl<T> SwrEngine<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Start building an engine for the resource type `namespace`.
    ///
    /// # Example
    /// ```ignore
    /// let products: SwrEngine<Vec<Product>> = SwrEngine::builder("products", config)
    ///     .backend(flat_store)
    ///     .fallback(PlaceholderFallback::new(sample_products()))
    ///     .build()?;
    /// ```
    pub fn builder(namespace: &str, config: CacheConfig) -> SwrEngineBuilder<T> {
        SwrEngineBuilder {
            namespace: namespace.to_string(),
            config,
            clock: Arc::new(SystemClock),
            persistent: None,
            fallback: Arc::new(NotFoundFallback),
        }
    }

    /// Memory-only engine with the default fallback.
    pub fn new(namespace: &str, config: CacheConfig) -> Result<Self, CacheError> {
        Self::builder(namespace, config).build()
    }

    pub fn namespace(&self) -> &str {
        &self.state.namespace
    }

    pub fn config(&self) -> &CacheConfig {
        &self.state.config
    }

    pub fn downgrade(&self) -> WeakEngine<T> {
        WeakEngine {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Receive an [`Update`] every time the state of `key` changes.
    pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription
    where
        F: Fn(&Update<T>) + Send + Sync + 'static,
    {
        self.state.subscribers.subscribe(key, Arc::new(callback))
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.state.subscribers.subscriber_count(key)
    }

    /// Whether an origin load for `key` is running.
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.state.coordinator.has_in_flight(key)
    }

    /// The entry held in memory for `key`, whatever its age.
    pub async fn peek(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        self.state.memory.peek(key).await
    }

    /// Stale-while-revalidate read of `key`.
    ///
    /// `load` is remembered for the key so that background revalidation, `refetch_if_stale`
    /// and `mutate(.., true)` can reach the origin later.
    ///
    /// # Example
    /// ```ignore
    /// let listing = products
    ///     .fetch(&CacheKey::products("acme"), |key| async move {
    ///         api.list_products(&key).await
    ///     }, FetchOptions::default())
    ///     .await?;
    /// ```
    pub async fn fetch<F, Fut>(
        &self,
        key: &CacheKey,
        load: F,
        opts: FetchOptions,
    ) -> Result<Fetched<T>, CacheError>
    where
        F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        self.fetch_with(key, remote_fetch(load), opts).await
    }

    /// [`SwrEngine::fetch`] with an already boxed remote function.
    pub async fn fetch_with(
        &self,
        key: &CacheKey,
        remote: RemoteFetch<T>,
        opts: FetchOptions,
    ) -> Result<Fetched<T>, CacheError> {
        self.register_fetcher(key, remote.clone());

        if !opts.force_refresh
            && let Some(pending) = self.state.coordinator.join(key)
        {
            tracing::debug!(
                "Joining in-flight fetch: namespace={}, key={}",
                self.state.namespace,
                key
            );
            return pending.await;
        }

        let lookup = self.lookup(key).await;

        if opts.force_refresh {
            return self
                .revalidate(key, remote, lookup.into_entry(), Revalidation::blocking(opts))
                .await;
        }

        match lookup {
            Lookup::Fresh(entry) => {
                if !opts.silent {
                    self.notify(key, Some(entry.data.clone()), None, false);
                }
                Ok(Fetched::settled(entry.data))
            }
            Lookup::Stale(entry) if !opts.silent => {
                self.notify(key, Some(entry.data.clone()), None, true);

                let this = self.clone();
                let task_key = key.clone();
                let prior = entry.clone();
                tokio::spawn(async move {
                    if let Err(e) = this
                        .revalidate(&task_key, remote, Some(prior), Revalidation::after_announcement())
                        .await
                    {
                        tracing::debug!("Background revalidation failed: key={}, error={}", task_key, e);
                    }
                });

                Ok(Fetched {
                    data: entry.data,
                    error: None,
                    is_validating: true,
                })
            }
            Lookup::Stale(entry) => {
                self.revalidate(key, remote, Some(entry), Revalidation::quiet())
                    .await
            }
            Lookup::Expired(entry) => {
                self.revalidate(key, remote, Some(entry), Revalidation::blocking(opts))
                    .await
            }
            Lookup::Missing => {
                self.revalidate(key, remote, None, Revalidation::blocking(opts))
                    .await
            }
        }
    }

    /// Write `data` optimistically and/or reload `key` from the origin.
    ///
    /// With `data`, memory and persistence are updated and subscribers notified before any
    /// network activity. With `should_refetch`, a forced fetch follows whose result
    /// supersedes the optimistic value. Returns the latest known value.
    pub async fn mutate(
        &self,
        key: &CacheKey,
        data: Option<T>,
        should_refetch: bool,
    ) -> Result<Option<T>, CacheError> {
        if let Some(data) = data {
            let entry = self.state.memory.set(key, data).await?;
            self.notify(key, Some(entry.data.clone()), None, false);
            self.persist(key, &entry).await;
        }

        if should_refetch {
            let remote = self
                .fetcher(key)
                .ok_or_else(|| CacheError::NoFetcher(key.to_string()))?;
            let fetched = self.fetch_with(key, remote, FetchOptions::force()).await?;
            return Ok(Some(fetched.data));
        }

        Ok(self.state.memory.peek(key).await.map(|entry| entry.data))
    }

    /// Refetch `key` unless its entry is fresh.
    ///
    /// Returns `None` when nothing had to be done. Uses the fetcher last registered for the
    /// key by [`SwrEngine::fetch`].
    pub async fn refetch_if_stale(
        &self,
        key: &CacheKey,
        silent: bool,
    ) -> Result<Option<Fetched<T>>, CacheError> {
        if self.freshness(key).await == Some(Freshness::Fresh) {
            return Ok(None);
        }

        let remote = self
            .fetcher(key)
            .ok_or_else(|| CacheError::NoFetcher(key.to_string()))?;
        let opts = FetchOptions {
            force_refresh: false,
            silent,
        };
        self.fetch_with(key, remote, opts).await.map(Some)
    }

    /// Drop cached data from memory and the persistent tier.
    ///
    /// Subscriptions and registered fetchers are kept.
    pub async fn clear_cache(&self, scope: impl Into<ClearScope>) {
        match scope.into() {
            ClearScope::Key(key) => {
                self.state.memory.delete(&key).await;
                if let Some(store) = &self.state.persistent {
                    store.remove(&key).await;
                }
                tracing::debug!("Cleared key={} in namespace={}", key, self.state.namespace);
            }
            ClearScope::All => {
                self.state.memory.clear();
                if let Some(store) = &self.state.persistent {
                    store.purge().await;
                }
                tracing::debug!("Cleared namespace={}", self.state.namespace);
            }
        }
    }

    /// Silently revalidate every stale key that somebody is subscribed to.
    ///
    /// Returns how many revalidations were started. Used by the background revalidator.
    pub async fn revalidate_observed(&self) -> usize {
        let mut pending = Vec::new();

        for key in self.state.subscribers.keys() {
            if !self
                .freshness(&key)
                .await
                .is_some_and(Freshness::needs_revalidation)
            {
                continue;
            }
            let Some(remote) = self.fetcher(&key) else {
                tracing::debug!("No fetcher registered for observed key={}", key);
                continue;
            };

            let this = self.clone();
            pending.push(async move {
                if let Err(e) = this.fetch_with(&key, remote, FetchOptions::silent()).await {
                    tracing::debug!("Background revalidation failed: key={}, error={}", key, e);
                }
            });
        }

        let started = pending.len();
        if started > 0 {
            tracing::debug!(
                "Revalidating {} observed key(s) in namespace={}",
                started,
                self.state.namespace
            );
        }
        join_all(pending).await;
        started
    }

    /// Memory first, then the persistent tier. Hydrated entries keep their timestamp.
    async fn lookup(&self, key: &CacheKey) -> Lookup<T> {
        let found = self.state.memory.lookup(key).await;
        if !matches!(found, Lookup::Missing) {
            return found;
        }

        let Some(store) = &self.state.persistent else {
            return Lookup::Missing;
        };
        let Some(entry) = store.load::<T>(key).await else {
            return Lookup::Missing;
        };

        let now = self.state.clock.now_ms();
        let freshness = entry.freshness(
            now,
            self.state.config.stale_time_ms,
            self.state.config.cache_time_ms,
        );
        match freshness {
            Freshness::Fresh => {
                self.state.memory.insert_entry(key, entry.clone()).await;
                tracing::debug!("Hydrated fresh entry from {}: key={}", store.backend_name(), key);
                Lookup::Fresh(entry)
            }
            Freshness::Stale => {
                self.state.memory.insert_entry(key, entry.clone()).await;
                tracing::debug!("Hydrated stale entry from {}: key={}", store.backend_name(), key);
                Lookup::Stale(entry)
            }
            Freshness::Expired => Lookup::Expired(entry),
        }
    }

    /// Age class of the in-memory entry, without evicting it.
    async fn freshness(&self, key: &CacheKey) -> Option<Freshness> {
        let entry = self.state.memory.peek(key).await?;
        Some(entry.freshness(
            self.state.clock.now_ms(),
            self.state.config.stale_time_ms,
            self.state.config.cache_time_ms,
        ))
    }

    /// Load `key` from the origin through the coordinator.
    async fn revalidate(
        &self,
        key: &CacheKey,
        remote: RemoteFetch<T>,
        prior: Option<CacheEntry<T>>,
        mode: Revalidation,
    ) -> Result<Fetched<T>, CacheError> {
        if mode.announce {
            self.notify(key, prior.as_ref().map(|e| e.data.clone()), None, true);
        }

        let this = self.clone();
        let task_key = key.clone();
        self.state
            .coordinator
            .run_tracked(key, mode.force, move |id| async move {
                this.load_from_origin(task_key, id, remote, prior, mode).await
            })
            .await
    }

    async fn load_from_origin(
        &self,
        key: CacheKey,
        id: u64,
        remote: RemoteFetch<T>,
        prior: Option<CacheEntry<T>>,
        mode: Revalidation,
    ) -> Result<Fetched<T>, CacheError> {
        let retry = self.state.coordinator.retry_policy();
        let result = fetch_with_retry(retry, &key, &remote).await;

        // A forced refresh started meanwhile owns the key now; committing here would roll
        // the cache back to older origin data.
        if !self.state.coordinator.is_current(&key, id) {
            return self.superseded(&key, result).await;
        }

        match result {
            Ok(data) => Ok(self.store_fetched(&key, data, mode).await),
            Err(error) => self.recover(&key, prior, error).await,
        }
    }

    /// Result for a request that lost its key to a newer one: the newer request's outcome,
    /// or whatever it left in memory. Nothing is written and nobody is notified.
    async fn superseded(
        &self,
        key: &CacheKey,
        result: Result<T, CacheError>,
    ) -> Result<Fetched<T>, CacheError> {
        tracing::debug!("Discarding superseded fetch result: key={}", key);

        if let Some(pending) = self.state.coordinator.join(key) {
            return pending.await;
        }
        if let Some(entry) = self.state.memory.peek(key).await {
            return Ok(Fetched::settled(entry.data));
        }
        result.map(Fetched::settled)
    }

    async fn store_fetched(&self, key: &CacheKey, data: T, mode: Revalidation) -> Fetched<T> {
        let previous = self.state.memory.peek(key).await;
        let unchanged = match (&previous, content_hash(&data)) {
            (Some(previous), Ok(hash)) => previous.content_hash == hash,
            _ => false,
        };

        if unchanged && let Some(previous) = previous {
            let entry = self.state.memory.touch(key, previous).await;
            self.persist(key, &entry).await;
            if mode.notify_unchanged() {
                self.notify(key, Some(entry.data.clone()), None, false);
            } else {
                tracing::debug!("Revalidation of key={} returned unchanged data", key);
            }
            return Fetched::settled(entry.data);
        }

        match self.state.memory.set(key, data.clone()).await {
            Ok(entry) => self.persist(key, &entry).await,
            Err(e) => tracing::warn!("Could not cache fetched value: key={}, error={}", key, e),
        }
        self.notify(key, Some(data.clone()), None, false);
        Fetched::settled(data)
    }

    /// Fall back to the last known data, or to the fallback policy if there is none.
    async fn recover(
        &self,
        key: &CacheKey,
        prior: Option<CacheEntry<T>>,
        error: CacheError,
    ) -> Result<Fetched<T>, CacheError> {
        let last_known = match self.state.memory.peek(key).await {
            Some(entry) => Some(entry),
            None => prior,
        };

        if let Some(entry) = last_known {
            tracing::warn!(
                "Serving last known data for key={} after failed fetch: {}",
                key,
                error
            );
            self.notify(key, Some(entry.data.clone()), Some(error.clone()), false);
            return Ok(Fetched {
                data: entry.data,
                error: Some(error),
                is_validating: false,
            });
        }

        match self.state.fallback.on_unrecoverable(key, &error) {
            FallbackAction::Placeholder(data) => {
                self.notify(key, Some(data), Some(error.clone()), false)
            }
            FallbackAction::NotFound => self.notify(key, None, Some(error.clone()), false),
            FallbackAction::Silent => {
                tracing::debug!("Fetch of key={} failed with nothing cached: {}", key, error)
            }
        }
        Err(error)
    }

    async fn persist(&self, key: &CacheKey, entry: &CacheEntry<T>) {
        if let Some(store) = &self.state.persistent {
            store.save(key, entry).await;
        }
    }

    fn notify(
        &self,
        key: &CacheKey,
        data: Option<T>,
        error: Option<CacheError>,
        is_validating: bool,
    ) {
        self.state.subscribers.notify(
            key,
            Update {
                data,
                error,
                is_validating,
            },
        );
    }

    fn register_fetcher(&self, key: &CacheKey, remote: RemoteFetch<T>) {
        let mut fetchers = self
            .state
            .fetchers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        fetchers.insert(key.clone(), remote);
    }

    fn fetcher(&self, key: &CacheKey) -> Option<RemoteFetch<T>> {
        let fetchers = self
            .state
            .fetchers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        fetchers.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> CacheConfig {
        CacheConfig {
            stale_time_ms: 100,
            cache_time_ms: 1_000,
            retry_count: 0,
            ..CacheConfig::default()
        }
    }

    fn engine(clock: Arc<ManualClock>) -> SwrEngine<String> {
        SwrEngine::builder("config", config())
            .clock(clock)
            .build()
            .unwrap()
    }

    fn counting(calls: Arc<AtomicUsize>) -> RemoteFetch<String> {
        remote_fetch(move |key: CacheKey| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{}#{}", key, n))
            }
        })
    }

    #[test]
    fn test_build_rejects_inverted_timings() {
        let config = CacheConfig {
            stale_time_ms: 1_000,
            cache_time_ms: 1_000,
            ..CacheConfig::default()
        };
        let result = SwrEngine::<String>::new("config", config);
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_silent_stale_fetch_waits_for_origin() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock.clone());
        let key = CacheKey::config("acme");
        let calls = Arc::new(AtomicUsize::new(0));

        engine
            .fetch_with(&key, counting(calls.clone()), FetchOptions::default())
            .await
            .unwrap();

        clock.set(150);
        let fetched = engine
            .fetch_with(&key, counting(calls.clone()), FetchOptions::silent())
            .await
            .unwrap();
        assert_eq!(fetched.data, "config_acme#1");
        assert!(!fetched.is_validating);
        assert_eq!(engine.peek(&key).await.unwrap().timestamp, 150);
    }

    #[tokio::test]
    async fn test_refetch_needs_a_registered_fetcher() {
        let engine = engine(Arc::new(ManualClock::new(0)));
        let result = engine
            .refetch_if_stale(&CacheKey::config("nobody"), false)
            .await;
        assert!(matches!(result, Err(CacheError::NoFetcher(_))));
    }

    #[tokio::test]
    async fn test_fetch_registers_the_latest_fetcher() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock.clone());
        let key = CacheKey::config("acme");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        engine
            .fetch_with(&key, counting(first.clone()), FetchOptions::default())
            .await
            .unwrap();
        // A fresh hit still replaces the remembered fetcher.
        engine
            .fetch_with(&key, counting(second.clone()), FetchOptions::default())
            .await
            .unwrap();

        clock.set(500);
        engine.refetch_if_stale(&key, true).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revalidate_observed_skips_fresh_and_unobserved_keys() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine(clock.clone());
        let observed = CacheKey::config("observed");
        let ignored = CacheKey::config("ignored");
        let calls = Arc::new(AtomicUsize::new(0));

        for key in [&observed, &ignored] {
            engine
                .fetch_with(key, counting(calls.clone()), FetchOptions::default())
                .await
                .unwrap();
        }
        let _sub = engine.subscribe(&observed, |_| {});

        assert_eq!(engine.revalidate_observed().await, 0);

        clock.set(300);
        assert_eq!(engine.revalidate_observed().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_engine_alive() {
        let engine = engine(Arc::new(ManualClock::new(0)));
        let weak = engine.downgrade();
        assert!(weak.upgrade().is_some());

        drop(engine);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_older_fetch_cannot_overwrite_forced_refresh() {
        let engine = engine(Arc::new(ManualClock::new(0)));
        let key = CacheKey::config("acme");
        let calls = Arc::new(AtomicUsize::new(0));

        // The first call reads revision 0 and answers late; later calls read revision 1.
        let remote = {
            let calls = calls.clone();
            remote_fetch(move |_key: CacheKey| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        Ok("rev0".to_string())
                    } else {
                        Ok("rev1".to_string())
                    }
                }
            })
        };

        let settled = Arc::new(std::sync::Mutex::new(Vec::new()));
        let settled_clone = settled.clone();
        let _sub = engine.subscribe(&key, move |update| {
            if !update.is_validating {
                settled_clone.lock().unwrap().push(update.data.clone());
            }
        });

        let slow = {
            let engine = engine.clone();
            let key = key.clone();
            let remote = remote.clone();
            tokio::spawn(async move {
                engine
                    .fetch_with(&key, remote, FetchOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let forced = engine
            .fetch_with(&key, remote, FetchOptions::force())
            .await
            .unwrap();
        assert_eq!(forced.data, "rev1");

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.data, "rev1");
        assert_eq!(engine.peek(&key).await.unwrap().data, "rev1");
        assert_eq!(*settled.lock().unwrap(), vec![Some("rev1".to_string())]);
        assert!(!engine.is_fetching(&key));
    }
}
