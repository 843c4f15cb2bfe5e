//! Periodic revalidation of observed keys.
//!
//! While subscribers are watching a key, its data should not silently age out. The
//! revalidator wakes up every `background_refetch_interval_ms` and asks the engine to
//! silently refetch every subscribed key that is no longer fresh.

use serde::{Serialize, de::DeserializeOwned};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::engine::SwrEngine;

/// Owns the background task. Dropping it stops the task.
#[derive(Default)]
pub struct BackgroundRevalidator {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundRevalidator {
    pub fn new() -> Self {
        BackgroundRevalidator {
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start revalidating `engine` at its configured interval, replacing any running task.
    ///
    /// Returns `false` and leaves nothing running if the interval is disabled. The task
    /// holds only a weak handle and ends on its own once the engine is dropped.
    pub fn start<T>(&self, engine: &SwrEngine<T>) -> bool
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let Some(interval) = engine.config().background_refetch_interval() else {
            self.stop();
            tracing::debug!(
                "Background revalidation disabled: namespace={}",
                engine.namespace()
            );
            return false;
        };

        let mut task = self.task();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(spawn_revalidation_task(engine, interval));
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for BackgroundRevalidator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_revalidation_task<T>(engine: &SwrEngine<T>, interval: Duration) -> JoinHandle<()>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    let weak = engine.downgrade();
    let namespace = engine.namespace().to_string();

    tokio::spawn(async move {
        tracing::info!(
            "Starting background revalidation: namespace={}, interval={:?}",
            namespace,
            interval
        );

        loop {
            tokio::time::sleep(interval).await;

            let Some(engine) = weak.upgrade() else {
                tracing::debug!("Engine dropped, stopping revalidation: namespace={}", namespace);
                break;
            };

            let started = engine.revalidate_observed().await;
            if started == 0 {
                tracing::trace!("Nothing to revalidate: namespace={}", namespace);
            }
        }
    })
}
