//! Registry of running watch caches.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use registry_core::{CacheKey, StoreError};

use crate::TreeCache;

#[derive(Default)]
struct Entries {
    active: HashMap<CacheKey, Arc<TreeCache>>,
    /// Replaced handles. Still running, still stopped at shutdown.
    retired: Vec<Arc<TreeCache>>,
    /// Set once `close_all` has drained the registry.
    closed: bool,
}

/// Path keyed watch caches with an ordered shutdown.
#[derive(Default)]
pub struct CacheRegistry {
    entries: Mutex<Entries>,
}

impl CacheRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `cache` under `path`, replacing any previous handle.
    ///
    /// The replaced handle is returned and keeps running.
    ///
    /// # Errors
    /// Returns `SessionClosed` once the registry has been shut down; the
    /// caller still owns `cache` and must close it.
    pub fn insert(
        &self,
        path: &str,
        cache: Arc<TreeCache>,
    ) -> Result<Option<Arc<TreeCache>>, StoreError> {
        let mut entries = self.entries();
        if entries.closed {
            return Err(StoreError::SessionClosed);
        }
        let previous = entries.active.insert(CacheKey::new(path), cache);
        if let Some(previous) = &previous {
            tracing::debug!(path, "Replacing registered tree cache");
            entries.retired.push(Arc::clone(previous));
        }
        Ok(previous)
    }

    /// Handle registered for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Arc<TreeCache>> {
        self.entries().active.get(&CacheKey::new(path)).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().active.is_empty()
    }

    /// Stop every cache ever registered and wait until all of them have
    /// finished, then wait `grace` more. Later inserts are refused.
    pub async fn close_all(&self, grace: Duration) {
        let caches: Vec<Arc<TreeCache>> = {
            let mut entries = self.entries();
            entries.closed = true;
            let mut caches: Vec<_> = entries.active.drain().map(|(_, c)| c).collect();
            caches.append(&mut entries.retired);
            caches
        };
        if caches.is_empty() {
            return;
        }

        tracing::debug!(count = caches.len(), "Closing tree caches");
        futures::future::join_all(caches.iter().map(|c| c.close())).await;

        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }
    }
}
