//! SQLite-backed session store.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::collaborators::SessionStore;
use crate::error::{Error, Result};
use crate::store::schema::{initialize_schema, is_initialized};

/// SQLite-backed key/blob store.
///
/// Statements are short single-row reads and upserts, so they run inline on
/// the calling task behind a mutex.
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Number of stored blobs.
    pub fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM memory_blobs", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT blob FROM memory_blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    async fn set(&self, key: &str, blob: String) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memory_blobs (key, blob, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
                params![key, blob, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM memory_blobs WHERE key = ?1", params![key])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = SqliteSessionStore::in_memory().unwrap();
        assert_eq!(store.get("insights:s1").await.unwrap(), None);

        store.set("insights:s1", "[]".to_string()).await.unwrap();
        assert_eq!(store.get("insights:s1").await.unwrap(), Some("[]".to_string()));
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.set("profile:u1", "{\"a\":1}".to_string()).await.unwrap();
        store.set("profile:u1", "{\"a\":2}".to_string()).await.unwrap();

        assert_eq!(
            store.get("profile:u1").await.unwrap(),
            Some("{\"a\":2}".to_string())
        );
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteSessionStore::in_memory().unwrap();
        store.set("insights:a", "[]".to_string()).await.unwrap();
        store.set("profile:u", "{}".to_string()).await.unwrap();

        store.delete("insights:a").await.unwrap();
        assert_eq!(store.get("insights:a").await.unwrap(), None);
        assert_eq!(store.len().unwrap(), 1);

        // Deleting a missing key is fine
        store.delete("insights:a").await.unwrap();
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");

        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store.set("insights:s1", "[1]".to_string()).await.unwrap();
        }

        let reopened = SqliteSessionStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("insights:s1").await.unwrap(),
            Some("[1]".to_string())
        );
    }
}
