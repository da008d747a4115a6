//! Per-key write locks.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key, so write-through for a key is serialized while
/// different keys proceed independently.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Forget an idle key. A key that is currently held is kept.
    pub async fn release(&self, key: &str) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(key)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}
