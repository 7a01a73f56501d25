use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::host::SnapshotStorage;

/// Durable snapshot storage backed by SQLite.
///
/// Only the Authority writes it, and never concurrently with a read in the
/// same tick, so a single mutex-wrapped connection is enough.
pub struct SqliteSnapshotStorage {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStorage {
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create snapshot directory: {}", data_dir.display())
        })?;

        let db_path = data_dir.join("n21-sync.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open snapshot DB: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )
        .context("Failed to configure snapshot DB pragmas")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );",
        )
        .context("Failed to initialize snapshot DB schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }
}

impl SnapshotStorage for SqliteSnapshotStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM snapshots WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read snapshot key {key}"))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO snapshots (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, Self::now()],
        )
        .with_context(|| format!("Failed to write snapshot key {key}"))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM snapshots WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to remove snapshot key {key}"))?;
        Ok(())
    }
}

/// In-memory snapshot storage for tests and hosts without a filesystem.
#[derive(Default)]
pub struct MemorySnapshotStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
