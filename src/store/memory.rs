//! Process-local session store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::collaborators::SessionStore;
use crate::error::Result;

/// Session store kept in a shared map.
///
/// Useful for tests and for single-process deployments that want the
/// lazy-load path without a database. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    blobs: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, blob: String) -> Result<()> {
        self.blobs.write().await.insert(key.to_string(), blob);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemorySessionStore::new();
        let clone = store.clone();
        store.set("k", "v".to_string()).await.unwrap();

        assert_eq!(clone.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(clone.len().await, 1);

        clone.delete("k").await.unwrap();
        assert!(store.is_empty().await);
        clone.delete("k").await.unwrap();
    }
}
