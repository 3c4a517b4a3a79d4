use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use strand_core::config::RuntimeConfig;
use strand_core::error::{Result, StrandError};
use strand_core::types::RunId;
use strand_graph::Workflow;
use strand_runtime::{resume, RunHandle, RunSnapshot};

use crate::store::{CheckpointInfo, CheckpointStore};

/// Checkpoints arbitrary serializable payloads against a pluggable
/// [`CheckpointStore`], keyed by run id.
///
/// The manager owns serialization; stores only see opaque JSON. The payload
/// is usually a [`RunSnapshot`] — the run-level helpers below wire that up —
/// but hosting layers can checkpoint their own state alongside.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Persist a payload as a new checkpoint for the run.
    pub fn create<T: Serialize>(&self, run_id: &RunId, payload: &T) -> Result<CheckpointInfo> {
        let json = serde_json::to_string(payload)?;
        let info = self.store.save(run_id, &json)?;
        info!(run_id = %info.run_id, checkpoint_id = info.checkpoint_id, "checkpoint created");
        Ok(info)
    }

    /// Load and deserialize the checkpoint named by `info`.
    pub fn restore<T: DeserializeOwned>(&self, info: &CheckpointInfo) -> Result<T> {
        let stored = self
            .store
            .load(&info.run_id, info.checkpoint_id)?
            .ok_or_else(|| {
                StrandError::Checkpoint(format!(
                    "checkpoint {} for run '{}' not found",
                    info.checkpoint_id, info.run_id
                ))
            })?;
        decode(&stored.snapshot_json, stored.info.checkpoint_id)
    }

    /// The most recent checkpoint payload stored for a run, deserialized.
    pub fn latest<T: DeserializeOwned>(&self, run_id: &RunId) -> Result<Option<T>> {
        match self.store.load_latest(run_id)? {
            Some(stored) => Ok(Some(decode(
                &stored.snapshot_json,
                stored.info.checkpoint_id,
            )?)),
            None => Ok(None),
        }
    }

    /// Snapshot a live run and persist it. Export preconditions (a drained
    /// event stream) are enforced by the run handle.
    pub async fn checkpoint_run(&self, handle: &RunHandle) -> Result<CheckpointInfo> {
        let snapshot = handle.export_checkpoint().await?;
        self.create(&snapshot.run_id, &snapshot)
    }

    /// Resume a run from its most recent stored checkpoint, on a freshly
    /// built workflow with the same topology.
    pub async fn resume_latest(
        &self,
        workflow: &Workflow,
        run_id: &RunId,
        config: RuntimeConfig,
    ) -> Result<Option<RunHandle>> {
        match self.latest::<RunSnapshot>(run_id)? {
            Some(snapshot) => {
                let handle = resume(workflow, snapshot, config).await?;
                info!(run_id = %run_id, "run restored from latest checkpoint");
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }

    pub fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointInfo>> {
        self.store.list(run_id)
    }

    pub fn delete(&self, run_id: &RunId) -> Result<usize> {
        self.store.delete(run_id)
    }
}

fn decode<T: DeserializeOwned>(json: &str, checkpoint_id: i64) -> Result<T> {
    serde_json::from_str(json).map_err(|e| {
        StrandError::Checkpoint(format!(
            "stored checkpoint {} does not decode: {}",
            checkpoint_id, e
        ))
    })
}
