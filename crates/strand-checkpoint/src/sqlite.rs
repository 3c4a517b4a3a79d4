use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::types::RunId;

use crate::store::{CheckpointInfo, CheckpointStore, StoredCheckpoint};

fn storage_err(context: &str, e: impl std::fmt::Display) -> StrandError {
    StrandError::Checkpoint(format!("{}: {}", context, e))
}

/// Persistent checkpoint store backed by SQLite.
///
/// Append-only: every save adds a row, `load_latest` reads the newest one.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| storage_err("failed to open checkpoint store", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_run
                 ON checkpoints(run_id, id DESC);",
        )
        .map_err(|e| storage_err("failed to initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, run_id: &RunId, snapshot_json: &str) -> Result<CheckpointInfo> {
        let created_at = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO checkpoints (run_id, snapshot_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![run_id.0, snapshot_json, created_at.to_rfc3339()],
        )
        .map_err(|e| storage_err("failed to save checkpoint", e))?;

        let checkpoint_id = conn.last_insert_rowid();
        debug!(run_id = %run_id, checkpoint_id, "checkpoint saved");
        Ok(CheckpointInfo {
            run_id: run_id.clone(),
            checkpoint_id,
            created_at,
        })
    }

    fn load(&self, run_id: &RunId, checkpoint_id: i64) -> Result<Option<StoredCheckpoint>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, snapshot_json, created_at
                 FROM checkpoints
                 WHERE run_id = ?1 AND id = ?2",
            )
            .map_err(|e| storage_err("failed to prepare query", e))?;

        stmt.query_row(params![run_id.0, checkpoint_id], |row| {
            let created_at: String = row.get(2)?;
            Ok(StoredCheckpoint {
                info: CheckpointInfo {
                    run_id: run_id.clone(),
                    checkpoint_id: row.get(0)?,
                    created_at: parse_timestamp(&created_at),
                },
                snapshot_json: row.get(1)?,
            })
        })
        .optional()
        .map_err(|e| storage_err("failed to load checkpoint", e))
    }

    fn load_latest(&self, run_id: &RunId) -> Result<Option<StoredCheckpoint>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, snapshot_json, created_at
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY id DESC
                 LIMIT 1",
            )
            .map_err(|e| storage_err("failed to prepare query", e))?;

        stmt.query_row(params![run_id.0], |row| {
            let created_at: String = row.get(2)?;
            Ok(StoredCheckpoint {
                info: CheckpointInfo {
                    run_id: run_id.clone(),
                    checkpoint_id: row.get(0)?,
                    created_at: parse_timestamp(&created_at),
                },
                snapshot_json: row.get(1)?,
            })
        })
        .optional()
        .map_err(|e| storage_err("failed to load checkpoint", e))
    }

    fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointInfo>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, created_at
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(|e| storage_err("failed to prepare query", e))?;

        let rows = stmt
            .query_map(params![run_id.0], |row| {
                let created_at: String = row.get(1)?;
                Ok(CheckpointInfo {
                    run_id: run_id.clone(),
                    checkpoint_id: row.get(0)?,
                    created_at: parse_timestamp(&created_at),
                })
            })
            .map_err(|e| storage_err("failed to list checkpoints", e))?;

        let mut infos = Vec::new();
        for row in rows {
            infos.push(row.map_err(|e| storage_err("failed to read checkpoint row", e))?);
        }
        Ok(infos)
    }

    fn delete(&self, run_id: &RunId) -> Result<usize> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM checkpoints WHERE run_id = ?1",
            params![run_id.0],
        )
        .map_err(|e| storage_err("failed to delete checkpoints", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqliteCheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("checkpoints.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_and_load_latest() {
        let (_dir, store) = temp_store();
        let run_id = RunId::from("run-1");

        store.save(&run_id, "{\"step\":1}").unwrap();
        store.save(&run_id, "{\"step\":2}").unwrap();

        let latest = store.load_latest(&run_id).unwrap().unwrap();
        assert_eq!(latest.snapshot_json, "{\"step\":2}");
        assert_eq!(latest.info.run_id, run_id);
    }

    #[test]
    fn test_load_by_id() {
        let (_dir, store) = temp_store();
        let run_id = RunId::from("run-1");

        let first = store.save(&run_id, "{\"step\":1}").unwrap();
        store.save(&run_id, "{\"step\":2}").unwrap();

        let loaded = store.load(&run_id, first.checkpoint_id).unwrap().unwrap();
        assert_eq!(loaded.snapshot_json, "{\"step\":1}");
        assert!(store.load(&run_id, 999).unwrap().is_none());
    }

    #[test]
    fn test_runs_are_isolated() {
        let (_dir, store) = temp_store();
        store.save(&RunId::from("a"), "{\"run\":\"a\"}").unwrap();
        store.save(&RunId::from("b"), "{\"run\":\"b\"}").unwrap();

        let loaded = store.load_latest(&RunId::from("a")).unwrap().unwrap();
        assert_eq!(loaded.snapshot_json, "{\"run\":\"a\"}");
    }

    #[test]
    fn test_list_oldest_first() {
        let (_dir, store) = temp_store();
        let run_id = RunId::from("run-1");
        let first = store.save(&run_id, "{}").unwrap();
        let second = store.save(&run_id, "{}").unwrap();

        let infos = store.list(&run_id).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].checkpoint_id, first.checkpoint_id);
        assert_eq!(infos[1].checkpoint_id, second.checkpoint_id);
    }

    #[test]
    fn test_delete_run() {
        let (_dir, store) = temp_store();
        let run_id = RunId::from("run-1");
        store.save(&run_id, "{}").unwrap();
        store.save(&run_id, "{}").unwrap();

        assert_eq!(store.delete(&run_id).unwrap(), 2);
        assert!(store.load_latest(&run_id).unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        let run_id = RunId::from("run-1");

        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.save(&run_id, "{\"durable\":true}").unwrap();
        }

        let reopened = SqliteCheckpointStore::open(&path).unwrap();
        let loaded = reopened.load_latest(&run_id).unwrap().unwrap();
        assert_eq!(loaded.snapshot_json, "{\"durable\":true}");
    }

    #[test]
    fn test_load_nonexistent() {
        let (_dir, store) = temp_store();
        assert!(store
            .load_latest(&RunId::from("ghost"))
            .unwrap()
            .is_none());
    }
}
