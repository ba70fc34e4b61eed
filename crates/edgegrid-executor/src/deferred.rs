//! Deferred task scheduler.
//!
//! Holds one delayed task per key (normally an entity id). Scheduling a key
//! again replaces the pending task; cancelling a key before its delay elapses
//! means the task never runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct TaskSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Cancellable delayed tasks keyed by entity id.
#[derive(Clone, Default)]
pub struct DeferredTasks {
    tasks: Arc<RwLock<HashMap<String, TaskSlot>>>,
    generation: Arc<AtomicU64>,
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless `key` is cancelled first.
    pub async fn schedule<F>(&self, key: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let task_key = key.clone();

        // Held across the spawn so the task cannot finish before its slot exists.
        let mut slots = self.tasks.write().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(key = %task_key, "deferred task firing");
            task.await;
            let mut slots = tasks.write().await;
            if slots.get(&task_key).is_some_and(|s| s.generation == generation) {
                slots.remove(&task_key);
            }
        });

        if let Some(old) = slots.insert(key.clone(), TaskSlot { generation, handle }) {
            old.handle.abort();
            debug!(%key, "replaced pending deferred task");
        }
        info!(%key, delay_ms = delay.as_millis() as u64, "deferred task scheduled");
    }

    /// Cancel the pending task for `key`. Returns true when one was pending.
    pub async fn cancel(&self, key: &str) -> bool {
        let mut slots = self.tasks.write().await;
        match slots.remove(key) {
            Some(slot) => {
                slot.handle.abort();
                info!(%key, "deferred task cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let mut slots = self.tasks.write().await;
        for (key, slot) in slots.drain() {
            slot.handle.abort();
            debug!(%key, "deferred task cancelled");
        }
    }

    pub async fn is_pending(&self, key: &str) -> bool {
        let slots = self.tasks.read().await;
        slots.get(key).is_some_and(|s| !s.handle.is_finished())
    }

    /// Keys with a task still waiting or running.
    pub async fn pending(&self) -> Vec<String> {
        let slots = self.tasks.read().await;
        slots.keys().cloned().collect()
    }
}
