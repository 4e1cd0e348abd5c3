use crate::naming::StorageKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Serialises persistence of batches that resolve to the same storage key.
///
/// Requests for different keys never wait on each other. Idle entries are
/// pruned whenever a new lock is taken.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<StorageKey, Arc<AsyncMutex<()>>>>,
}

/// Held while a batch is being persisted
#[derive(Debug)]
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other request is persisting under `key`
    pub async fn lock(&self, key: &StorageKey) -> KeyGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Only the map itself holds idle entries
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };

        trace!(key = %key, "Waiting for storage key lock");

        KeyGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
