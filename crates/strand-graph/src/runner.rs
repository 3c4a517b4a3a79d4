use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use strand_core::error::Result;
use strand_core::types::{ExecutorId, ExecutorIdentity, MessageEnvelope, PortableValue};

use crate::edge::{EdgePredicate, FanOutTarget};

/// A routing decision: deliver this envelope to this executor.
#[derive(Debug, Clone)]
pub struct EdgeDelivery {
    pub target: ExecutorId,
    pub envelope: MessageEnvelope,
}

impl EdgeDelivery {
    fn new(target: &ExecutorId, envelope: MessageEnvelope) -> Self {
        Self {
            target: target.clone(),
            envelope: envelope.with_target(target.clone()),
        }
    }
}

/// Routes one source's message to a single target, optionally gated by a
/// predicate.
pub struct DirectEdgeRunner {
    target: ExecutorId,
    predicate: Option<EdgePredicate>,
}

impl DirectEdgeRunner {
    pub fn new(target: ExecutorId, predicate: Option<EdgePredicate>) -> Self {
        Self { target, predicate }
    }

    pub fn chase(&self, envelope: &MessageEnvelope) -> Vec<EdgeDelivery> {
        let passes = self.predicate.as_ref().map_or(true, |p| p(envelope));
        if passes {
            vec![EdgeDelivery::new(&self.target, envelope.clone())]
        } else {
            vec![]
        }
    }
}

/// Replicates one source's message to every target whose own predicate
/// passes; zero, some, or all targets may match.
pub struct FanOutEdgeRunner {
    targets: Vec<FanOutTarget>,
}

impl FanOutEdgeRunner {
    pub fn new(targets: Vec<FanOutTarget>) -> Self {
        Self { targets }
    }

    pub fn chase(&self, envelope: &MessageEnvelope) -> Vec<EdgeDelivery> {
        self.targets
            .iter()
            .filter(|t| t.predicate.as_ref().map_or(true, |p| p(envelope)))
            .map(|t| EdgeDelivery::new(&t.target, envelope.clone()))
            .collect()
    }
}

/// Partial accumulation for one fan-in connection: the latest contribution
/// per source. Serialized into checkpoints keyed by the edge's connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanInState {
    contributions: HashMap<String, PortableValue>,
}

impl FanInState {
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }
}

/// Synchronization barrier over N named sources: fires toward the single
/// sink only once every source has contributed since the last firing.
pub struct FanInEdgeRunner {
    sources: Vec<ExecutorId>,
    target: ExecutorId,
}

impl FanInEdgeRunner {
    pub fn new(sources: Vec<ExecutorId>, target: ExecutorId) -> Self {
        Self { sources, target }
    }

    /// Record `source`'s contribution. Returns a delivery only when the set
    /// is complete; `None` means "not yet", and the branch stalls until the
    /// remaining contributions arrive.
    ///
    /// A source posting twice before the set completes overwrites its
    /// earlier contribution (last-write-wins per source, no merge). The
    /// fired delivery carries contributions in source-declaration order,
    /// not arrival order.
    pub fn chase(
        &self,
        source: &ExecutorId,
        envelope: &MessageEnvelope,
        state: &mut FanInState,
    ) -> Result<Option<EdgeDelivery>> {
        state
            .contributions
            .insert(source.0.clone(), envelope.message.clone());

        let complete = self
            .sources
            .iter()
            .all(|s| state.contributions.contains_key(&s.0));
        if !complete {
            debug!(
                source = %source,
                have = state.contributions.len(),
                want = self.sources.len(),
                "fan-in waiting for remaining contributions"
            );
            return Ok(None);
        }

        let ordered: Vec<PortableValue> = self
            .sources
            .iter()
            .filter_map(|s| state.contributions.remove(&s.0))
            .collect();
        state.contributions.clear();

        let aggregate = PortableValue::aggregate(ordered)?;
        let envelope = MessageEnvelope::new(aggregate, ExecutorIdentity::executor(source.clone()));
        Ok(Some(EdgeDelivery::new(&self.target, envelope)))
    }
}
