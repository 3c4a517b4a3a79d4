use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use strand_core::types::{ExecutorId, ExternalRequest, RunId};
use strand_graph::FanInState;

use crate::state::StateSnapshot;
use crate::step::QueuedMessages;

/// Current snapshot format version. Bumped on incompatible layout changes;
/// import rejects any other version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume a run on a freshly built workflow graph:
/// durable state, partial fan-in accumulation, the queued messages for the
/// next super-step, outstanding external requests, and the set of executors
/// that had been materialized.
///
/// The graph topology itself is not captured; the importer must supply a
/// workflow with the same executors, edges, and ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: u32,
    pub run_id: RunId,
    /// Super-step counter at export time; the resumed run continues from it.
    pub step: u64,
    pub state: StateSnapshot,
    /// Fan-in accumulation keyed by encoded connection.
    pub edge_state: HashMap<String, FanInState>,
    pub queued: Vec<QueuedMessages>,
    pub outstanding: Vec<ExternalRequest>,
    pub instantiated: Vec<ExecutorId>,
}
