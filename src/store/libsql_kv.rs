//! libSQL backend — `KvStore` over a single ordered table.
//!
//! Supports local file and in-memory databases. The table is deliberately a
//! dumb `(key, value)` pair: the engine never asks the backend for anything
//! beyond single-key writes and sorted prefix scans.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::error::StoreError;
use crate::store::KvStore;

/// libSQL key/value backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlKv {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlKv {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Create the kv table if missing. Idempotent.
    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                (),
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Schema init failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for LibSqlKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT value FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Backend(format!("Query failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(format!("Row read failed: {e}")))?
        {
            Some(row) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| StoreError::Backend(format!("Column read failed: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Write failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Backend(format!("Delete failed: {e}")))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        // Half-open range scan: prefix <= key < prefix + 0x7f sentinel.
        // All engine keys are printable ASCII below the sentinel.
        let upper = format!("{prefix}\u{7f}");
        let mut rows = self
            .conn
            .query(
                "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
                params![prefix, upper],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Scan failed: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(format!("Row read failed: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| StoreError::Backend(format!("Column read failed: {e}")))?;
            let value: String = row
                .get(1)
                .map_err(|e| StoreError::Backend(format!("Column read failed: {e}")))?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}
