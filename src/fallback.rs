//! What an engine does when a fetch fails and there is no cached data to fall back to.
//!
//! Different resources want different things here: a product listing can show sample
//! products, a product page wants a not-found state, and store configuration may simply
//! keep quiet. The choice is made per engine.

use crate::error::CacheError;
use crate::key::CacheKey;

/// How subscribers are told about an unrecoverable failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackAction<T> {
    /// Show this data instead, alongside the error.
    Placeholder(T),
    /// Notify subscribers with no data and the error.
    NotFound,
    /// Do not notify anyone. The caller still receives the error.
    Silent,
}

/// Decides the [`FallbackAction`] for a failed fetch with nothing cached.
///
/// Closures of the shape `Fn(&CacheKey, &CacheError) -> FallbackAction<T>` implement it.
pub trait FallbackPolicy<T>: Send + Sync {
    fn on_unrecoverable(&self, key: &CacheKey, error: &CacheError) -> FallbackAction<T>;
}

impl<T, F> FallbackPolicy<T> for F
where
    F: Fn(&CacheKey, &CacheError) -> FallbackAction<T> + Send + Sync,
{
    fn on_unrecoverable(&self, key: &CacheKey, error: &CacheError) -> FallbackAction<T> {
        self(key, error)
    }
}

/// Notify subscribers with an empty, errored update. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundFallback;

impl<T> FallbackPolicy<T> for NotFoundFallback {
    fn on_unrecoverable(&self, _key: &CacheKey, _error: &CacheError) -> FallbackAction<T> {
        FallbackAction::NotFound
    }
}

/// Leave subscribers untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentFallback;

impl<T> FallbackPolicy<T> for SilentFallback {
    fn on_unrecoverable(&self, _key: &CacheKey, _error: &CacheError) -> FallbackAction<T> {
        FallbackAction::Silent
    }
}

/// Show fixed placeholder data, e.g. a sample product listing.
#[derive(Debug, Clone)]
pub struct PlaceholderFallback<T> {
    data: T,
}

impl<T> PlaceholderFallback<T> {
    pub fn new(data: T) -> Self {
        PlaceholderFallback { data }
    }
}

impl<T> FallbackPolicy<T> for PlaceholderFallback<T>
where
    T: Clone + Send + Sync,
{
    fn on_unrecoverable(&self, key: &CacheKey, error: &CacheError) -> FallbackAction<T> {
        tracing::info!("Serving placeholder data for key={} after: {}", key, error);
        FallbackAction::Placeholder(self.data.clone())
    }
}
