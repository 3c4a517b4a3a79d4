use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strand_core::error::Result;
use strand_core::types::RunId;

/// Metadata identifying one stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub run_id: RunId,
    /// Store-assigned sequence number, strictly increasing per store.
    pub checkpoint_id: i64,
    pub created_at: DateTime<Utc>,
}

/// A checkpoint as persisted: its metadata plus the serialized snapshot.
#[derive(Debug, Clone)]
pub struct StoredCheckpoint {
    pub info: CheckpointInfo,
    pub snapshot_json: String,
}

/// Durable storage for run snapshots.
///
/// Stores are append-only: saving never destroys an earlier checkpoint of
/// the same run, so a run can be rolled back past a bad resume.
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot, returning its assigned metadata.
    fn save(&self, run_id: &RunId, snapshot_json: &str) -> Result<CheckpointInfo>;

    /// A specific checkpoint by its assigned id, if it exists for the run.
    fn load(&self, run_id: &RunId, checkpoint_id: i64) -> Result<Option<StoredCheckpoint>>;

    /// The most recent checkpoint for a run, if any.
    fn load_latest(&self, run_id: &RunId) -> Result<Option<StoredCheckpoint>>;

    /// Metadata for every checkpoint of a run, oldest first.
    fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointInfo>>;

    /// Remove every checkpoint of a run. Returns the number removed.
    fn delete(&self, run_id: &RunId) -> Result<usize>;
}

/// Non-durable store for tests and single-process callers.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    next_id: i64,
    checkpoints: HashMap<String, Vec<StoredCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, run_id: &RunId, snapshot_json: &str) -> Result<CheckpointInfo> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let info = CheckpointInfo {
            run_id: run_id.clone(),
            checkpoint_id: inner.next_id,
            created_at: Utc::now(),
        };
        inner
            .checkpoints
            .entry(run_id.0.clone())
            .or_default()
            .push(StoredCheckpoint {
                info: info.clone(),
                snapshot_json: snapshot_json.to_string(),
            });
        Ok(info)
    }

    fn load(&self, run_id: &RunId, checkpoint_id: i64) -> Result<Option<StoredCheckpoint>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.checkpoints.get(&run_id.0).and_then(|list| {
            list.iter()
                .find(|cp| cp.info.checkpoint_id == checkpoint_id)
                .cloned()
        }))
    }

    fn load_latest(&self, run_id: &RunId) -> Result<Option<StoredCheckpoint>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .checkpoints
            .get(&run_id.0)
            .and_then(|list| list.last().cloned()))
    }

    fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointInfo>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .checkpoints
            .get(&run_id.0)
            .map(|list| list.iter().map(|cp| cp.info.clone()).collect())
            .unwrap_or_default())
    }

    fn delete(&self, run_id: &RunId) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .checkpoints
            .remove(&run_id.0)
            .map(|list| list.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_latest_wins() {
        let store = InMemoryCheckpointStore::new();
        let run_id = RunId::from("run-1");

        store.save(&run_id, "{\"step\":1}").unwrap();
        store.save(&run_id, "{\"step\":2}").unwrap();

        let latest = store.load_latest(&run_id).unwrap().unwrap();
        assert_eq!(latest.snapshot_json, "{\"step\":2}");
        assert_eq!(store.list(&run_id).unwrap().len(), 2);
    }

    #[test]
    fn test_load_by_id() {
        let store = InMemoryCheckpointStore::new();
        let run_id = RunId::from("run-1");

        let first = store.save(&run_id, "{\"step\":1}").unwrap();
        store.save(&run_id, "{\"step\":2}").unwrap();

        let loaded = store.load(&run_id, first.checkpoint_id).unwrap().unwrap();
        assert_eq!(loaded.snapshot_json, "{\"step\":1}");
        assert!(store.load(&run_id, 999).unwrap().is_none());
    }

    #[test]
    fn test_missing_run_loads_none() {
        let store = InMemoryCheckpointStore::new();
        assert!(store
            .load_latest(&RunId::from("ghost"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete_removes_all() {
        let store = InMemoryCheckpointStore::new();
        let run_id = RunId::from("run-1");
        store.save(&run_id, "{}").unwrap();
        store.save(&run_id, "{}").unwrap();

        assert_eq!(store.delete(&run_id).unwrap(), 2);
        assert!(store.load_latest(&run_id).unwrap().is_none());
    }

    #[test]
    fn test_ids_strictly_increase() {
        let store = InMemoryCheckpointStore::new();
        let a = store.save(&RunId::from("a"), "{}").unwrap();
        let b = store.save(&RunId::from("b"), "{}").unwrap();
        assert!(b.checkpoint_id > a.checkpoint_id);
    }
}
