use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::key::CacheKey;

/// A remote fetch function. Receives the key being loaded.
pub type RemoteFetch<T> =
    Arc<dyn Fn(CacheKey) -> BoxFuture<'static, Result<T, CacheError>> + Send + Sync>;

/// Wrap a closure returning a future into a [`RemoteFetch`].
pub fn remote_fetch<T, F, Fut>(load: F) -> RemoteFetch<T>
where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
{
    Arc::new(move |key| load(key).boxed())
}

/// How often and how patiently to retry a failed remote fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retry_count: u32,
    /// Delay before the first retry; doubled for every further one.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        RetryPolicy {
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based): `retry_delay * 2^(attempt - 1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

/// Call `remote` until it succeeds, fails with a non-retryable error, or the retries run
/// out. The last error is returned.
pub async fn fetch_with_retry<T>(
    policy: RetryPolicy,
    key: &CacheKey,
    remote: &RemoteFetch<T>,
) -> Result<T, CacheError> {
    let mut attempt = 0;
    loop {
        match remote(key.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                tracing::debug!("Not retrying key={}: {}", key, e);
                return Err(e);
            }
            Err(e) if attempt >= policy.retry_count => {
                tracing::warn!(
                    "Giving up on key={} after {} attempt(s): {}",
                    key,
                    attempt + 1,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::debug!(
                    "Fetch failed for key={}, retry {}/{} in {:?}: {}",
                    key,
                    attempt,
                    policy.retry_count,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

type Pending<O> = Shared<BoxFuture<'static, Result<O, CacheError>>>;

struct InFlight<O> {
    id: u64,
    pending: Pending<O>,
}

type InFlightTable<O> = Arc<Mutex<HashMap<CacheKey, InFlight<O>>>>;

fn lock<O>(table: &Mutex<HashMap<CacheKey, InFlight<O>>>) -> MutexGuard<'_, HashMap<CacheKey, InFlight<O>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a request from the in-flight table when its task ends, however it ends.
struct InFlightGuard<O> {
    table: InFlightTable<O>,
    key: CacheKey,
    id: u64,
}

impl<O> Drop for InFlightGuard<O> {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        // A forced refresh may have replaced this request; leave the newer one alone.
        if table.get(&self.key).is_some_and(|f| f.id == self.id) {
            table.remove(&self.key);
        }
    }
}

/// Deduplicates concurrent remote operations per key.
///
/// Each operation runs as its own task, so it runs to completion and its side effects
/// land even if every caller stops waiting. All callers that join an operation observe the
/// same result.
pub struct RequestCoordinator<O> {
    in_flight: InFlightTable<O>,
    next_id: Arc<AtomicU64>,
    retry: RetryPolicy,
}

impl<O> Clone for RequestCoordinator<O> {
    fn clone(&self) -> Self {
        RequestCoordinator {
            in_flight: Arc::clone(&self.in_flight),
            next_id: Arc::clone(&self.next_id),
            retry: self.retry,
        }
    }
}

impl<O> RequestCoordinator<O>
where
    O: Clone + Send + Sync + 'static,
{
    pub fn new(retry: RetryPolicy) -> Self {
        RequestCoordinator {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn has_in_flight(&self, key: &CacheKey) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// The pending result of the operation running for `key`, if any.
    pub fn join(&self, key: &CacheKey) -> Option<Pending<O>> {
        lock(&self.in_flight).get(key).map(|f| f.pending.clone())
    }

    /// Fetch `key` through `remote` with retry and backoff, coalescing with any
    /// operation already running for the key unless `force_refresh` is set.
    pub async fn fetch(
        &self,
        key: &CacheKey,
        remote: RemoteFetch<O>,
        force_refresh: bool,
    ) -> Result<O, CacheError> {
        let retry = self.retry;
        let task_key = key.clone();
        self.run(key, force_refresh, async move {
            fetch_with_retry(retry, &task_key, &remote).await
        })
        .await
    }

    /// Whether request `id` is still the one registered for `key`.
    ///
    /// Turns false once a forced refresh has superseded the request.
    pub fn is_current(&self, key: &CacheKey, id: u64) -> bool {
        lock(&self.in_flight).get(key).is_some_and(|f| f.id == id)
    }

    /// Run `operation` as the in-flight request for `key`.
    ///
    /// Without `force_refresh`, a request already in flight is joined instead and
    /// `operation` is dropped unpolled. With it, `operation` always starts and supersedes
    /// the table entry.
    pub async fn run<Fut>(
        &self,
        key: &CacheKey,
        force_refresh: bool,
        operation: Fut,
    ) -> Result<O, CacheError>
    where
        Fut: Future<Output = Result<O, CacheError>> + Send + 'static,
    {
        self.start(key, force_refresh, |_| operation).await
    }

    /// Like [`RequestCoordinator::run`], but `make` receives the id of the request it
    /// builds so the operation can check [`RequestCoordinator::is_current`] before
    /// committing its result.
    pub async fn run_tracked<F, Fut>(
        &self,
        key: &CacheKey,
        force_refresh: bool,
        make: F,
    ) -> Result<O, CacheError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<O, CacheError>> + Send + 'static,
    {
        self.start(key, force_refresh, make).await
    }

    fn start<F, Fut>(&self, key: &CacheKey, force_refresh: bool, make: F) -> Pending<O>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<O, CacheError>> + Send + 'static,
    {
        let mut table = lock(&self.in_flight);

        if !force_refresh && let Some(existing) = table.get(key) {
            tracing::debug!("Coalescing with in-flight request: key={}", key);
            return existing.pending.clone();
        }

        // The table lock is held until the entry is inserted, so the guard of a task that
        // finishes immediately cannot run before the entry exists.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard {
            table: Arc::clone(&self.in_flight),
            key: key.clone(),
            id,
        };
        let operation = make(id);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            operation.await
        });

        let task_key = key.clone();
        let pending = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::network(
                    task_key.as_str(),
                    format!("fetch task failed: {}", e),
                )),
            }
        }
        .boxed()
        .shared();

        table.insert(
            key.clone(),
            InFlight {
                id,
                pending: pending.clone(),
            },
        );
        pending
    }
}
