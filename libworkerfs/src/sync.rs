//! Per-key mutual exclusion.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

/// Serializes work on the same key while leaving other keys unaffected.
#[async_trait]
pub trait KeyedMutex: Send + Sync {
    /// Waits until no other holder of `key` remains.
    async fn acquire(&self, key: &str) -> KeyedLock;
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Exclusive hold on one key; released when dropped.
pub struct KeyedLock {
    key: String,
    release: Option<Release>,
}

impl KeyedLock {
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for KeyedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLock").field("key", &self.key).finish()
    }
}

impl Drop for KeyedLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// In-process [`KeyedMutex`]. Entries exist only while a key is held or
/// awaited.
#[derive(Clone, Default)]
pub struct LocalKeyedMutex {
    locks: Arc<LockMap>,
}

impl LocalKeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyedMutex for LocalKeyedMutex {
    async fn acquire(&self, key: &str) -> KeyedLock {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = entry.lock_owned().await;

        let map: Weak<LockMap> = Arc::downgrade(&self.locks);
        let owned_key = key.to_string();
        KeyedLock::new(key, move || {
            let mutex = tokio::sync::OwnedMutexGuard::mutex(&guard).clone();
            drop(guard);
            let Some(map) = map.upgrade() else {
                return;
            };
            let mut locks = map.lock().unwrap_or_else(PoisonError::into_inner);
            // one reference in the map, one here: nobody else holds or waits
            if Arc::strong_count(&mutex) == 2
                && locks
                    .get(&owned_key)
                    .is_some_and(|current| Arc::ptr_eq(current, &mutex))
            {
                locks.remove(&owned_key);
            }
        })
    }
}
