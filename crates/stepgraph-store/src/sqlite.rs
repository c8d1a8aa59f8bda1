use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use stepgraph_core::error::{ProcessError, Result};
use stepgraph_core::traits::StorageConnector;

/// SQLite-backed storage. One row per key, the document kept as JSON text.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| ProcessError::Database(format!("{}: {}", path.display(), e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| ProcessError::Database(e.to_string()))?;

        Self::init_schema(&conn)?;

        debug!(path = %path.display(), "SQLite storage opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| ProcessError::Database(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS process_state (
                key TEXT PRIMARY KEY,
                blob TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(|e| ProcessError::Database(e.to_string()))
    }

    /// Keys starting with `prefix`, sorted. `"{run_id}."` lists one run.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| ProcessError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT key FROM process_state WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(|e| ProcessError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(|e| ProcessError::Database(e.to_string()))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ProcessError::Database(e.to_string()))
    }

    fn read(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().map_err(|e| ProcessError::Database(e.to_string()))?;
        let blob: Option<String> = conn
            .query_row(
                "SELECT blob FROM process_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ProcessError::Database(e.to_string()))?;

        match blob {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, blob: &Value) -> Result<()> {
        let text = serde_json::to_string(blob)?;
        let conn = self.conn.lock().map_err(|e| ProcessError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO process_state (key, blob, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
            params![key, text, Utc::now().to_rfc3339()],
        )
        .map_err(|e| ProcessError::Database(e.to_string()))?;
        Ok(())
    }
}

impl StorageConnector for SqliteStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>>> {
        let key = key.to_string();
        Box::pin(async move { self.read(&key) })
    }

    fn put(&self, key: &str, blob: Value) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move { self.write(&key, &blob) })
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
