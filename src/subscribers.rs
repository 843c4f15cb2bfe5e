use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::CacheError;
use crate::key::CacheKey;

/// What subscribers receive whenever the state of a key changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Update<T> {
    /// Latest known data, `None` if there is nothing to show.
    pub data: Option<T>,
    /// The error of the last fetch, if it failed.
    pub error: Option<CacheError>,
    /// Whether a fetch for the key is under way.
    pub is_validating: bool,
}

pub type Callback<T> = Arc<dyn Fn(&Update<T>) + Send + Sync>;

struct RegistryState<T> {
    next_id: u64,
    subscribers: HashMap<CacheKey, HashMap<u64, Callback<T>>>,
}

/// Per-key sets of subscriber callbacks.
pub struct SubscriberRegistry<T> {
    state: Arc<Mutex<RegistryState<T>>>,
}

impl<T> Clone for SubscriberRegistry<T> {
    fn clone(&self) -> Self {
        SubscriberRegistry {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for SubscriberRegistry<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(state: &Mutex<RegistryState<T>>) -> MutexGuard<'_, RegistryState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> SubscriberRegistry<T>
where
    T: Send + 'static,
{
    pub fn new() -> Self {
        SubscriberRegistry {
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Register `callback` for updates of `key`.
    ///
    /// The returned handle unsubscribes when [`Subscription::unsubscribe`] is called or
    /// when it is dropped.
    pub fn subscribe(&self, key: &CacheKey, callback: Callback<T>) -> Subscription {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state
                .subscribers
                .entry(key.clone())
                .or_default()
                .insert(id, callback);
            id
        };

        let weak: Weak<Mutex<RegistryState<T>>> = Arc::downgrade(&self.state);
        let key = key.clone();
        Subscription {
            cancel: Some(Box::new(move || {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let mut state = lock(&state);
                if let Some(set) = state.subscribers.get_mut(&key) {
                    set.remove(&id);
                    if set.is_empty() {
                        state.subscribers.remove(&key);
                    }
                }
            })),
        }
    }

    /// Deliver `update` to every subscriber of `key` and return how many received it.
    ///
    /// A panicking callback is logged and skipped; the others are still called.
    pub fn notify(&self, key: &CacheKey, update: Update<T>) -> usize {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<Callback<T>> = match lock(&self.state).subscribers.get(key) {
            Some(set) => set.values().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&update))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!("Subscriber panicked while handling key={}", key),
            }
        }
        delivered
    }

    /// Keys with at least one subscriber.
    pub fn keys(&self) -> Vec<CacheKey> {
        lock(&self.state).subscribers.keys().cloned().collect()
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        lock(&self.state)
            .subscribers
            .get(key)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn has_subscribers(&self, key: &CacheKey) -> bool {
        self.subscriber_count(key) > 0
    }
}

/// Handle returned by `subscribe`.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Stop receiving updates.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
