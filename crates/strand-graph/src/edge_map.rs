use std::collections::HashMap;

use tracing::{debug, warn};

use strand_core::error::{Result, StrandError};
use strand_core::types::{ExecutorId, ExternalResponse, MessageEnvelope, PortId};

use crate::edge::{Connection, Edge};
use crate::runner::{
    DirectEdgeRunner, EdgeDelivery, FanInEdgeRunner, FanInState, FanOutEdgeRunner,
};

/// One runner dispatched by its construction-time discriminant — no runtime
/// type inspection in the hot path.
enum EdgeRunner {
    Direct(DirectEdgeRunner),
    FanOut(FanOutEdgeRunner),
    FanIn(FanInEdgeRunner),
}

struct EdgeSlot {
    connection: Connection,
    runner: EdgeRunner,
}

/// Owns every edge runner plus the port-to-executor bindings, and routes
/// incoming messages and external responses to the matching runner.
///
/// Only fan-in accumulation is stateful; it is exported to and imported from
/// checkpoints keyed by the edge's encoded [`Connection`].
pub struct EdgeMap {
    start: ExecutorId,
    slots: Vec<EdgeSlot>,
    by_source: HashMap<ExecutorId, Vec<usize>>,
    ports: HashMap<PortId, ExecutorId>,
    fan_in: HashMap<Connection, FanInState>,
}

impl EdgeMap {
    pub fn new(
        start: ExecutorId,
        edges: &[Edge],
        ports: impl IntoIterator<Item = (PortId, ExecutorId)>,
    ) -> Self {
        let mut slots = Vec::with_capacity(edges.len());
        let mut by_source: HashMap<ExecutorId, Vec<usize>> = HashMap::new();
        let mut fan_in = HashMap::new();

        for edge in edges {
            let connection = edge.connection();
            let runner = match edge {
                Edge::Direct {
                    target, predicate, ..
                } => EdgeRunner::Direct(DirectEdgeRunner::new(target.clone(), predicate.clone())),
                Edge::FanOut { targets, .. } => {
                    EdgeRunner::FanOut(FanOutEdgeRunner::new(targets.clone()))
                }
                Edge::FanIn { sources, target } => {
                    fan_in.insert(connection.clone(), FanInState::default());
                    EdgeRunner::FanIn(FanInEdgeRunner::new(sources.clone(), target.clone()))
                }
            };

            let index = slots.len();
            slots.push(EdgeSlot { connection, runner });
            for source in edge.sources() {
                by_source.entry(source.clone()).or_default().push(index);
            }
        }

        Self {
            start,
            slots,
            by_source,
            ports: ports.into_iter().collect(),
            fan_in,
        }
    }

    /// Route a message emitted by `source` through every edge listening on
    /// it, collecting the resulting deliveries.
    pub fn invoke_edges(
        &mut self,
        source: &ExecutorId,
        envelope: &MessageEnvelope,
    ) -> Result<Vec<EdgeDelivery>> {
        let Some(indexes) = self.by_source.get(source) else {
            debug!(source = %source, "no outgoing edges; message dropped");
            return Ok(vec![]);
        };

        let mut deliveries = Vec::new();
        for &index in indexes {
            let slot = &self.slots[index];
            match &slot.runner {
                EdgeRunner::Direct(runner) => deliveries.extend(runner.chase(envelope)),
                EdgeRunner::FanOut(runner) => deliveries.extend(runner.chase(envelope)),
                EdgeRunner::FanIn(runner) => {
                    let state = self
                        .fan_in
                        .entry(slot.connection.clone())
                        .or_default();
                    if let Some(delivery) = runner.chase(source, envelope, state)? {
                        deliveries.push(delivery);
                    }
                }
            }
        }
        Ok(deliveries)
    }

    /// Route an external input message along the graph's entry edge, to the
    /// designated start executor.
    pub fn invoke_input(&self, envelope: &MessageEnvelope) -> EdgeDelivery {
        EdgeDelivery {
            target: self.start.clone(),
            envelope: envelope.clone().with_target(self.start.clone()),
        }
    }

    /// Route an external response to the executor bound to its port.
    ///
    /// An unknown port id means the graph and the response are out of sync
    /// (a bug or a stale checkpoint) and is a fatal routing error.
    pub fn invoke_response(&self, response: &ExternalResponse) -> Result<EdgeDelivery> {
        let target = self
            .ports
            .get(&response.port_id)
            .ok_or_else(|| StrandError::UnknownPort(response.port_id.to_string()))?;

        let envelope = MessageEnvelope::external(response.payload.clone());
        Ok(EdgeDelivery {
            target: target.clone(),
            envelope: envelope.with_target(target.clone()),
        })
    }

    /// Export fan-in accumulation keyed by encoded connection. Direct and
    /// fan-out runners are stateless.
    pub fn export_state(&self) -> HashMap<String, FanInState> {
        self.fan_in
            .iter()
            .map(|(connection, state)| (connection.encode(), state.clone()))
            .collect()
    }

    /// Replace all fan-in accumulation from a checkpoint snapshot.
    ///
    /// Snapshot entries whose connection no longer exists in the graph are
    /// skipped with a warning; unknown ports stay fatal, but a removed edge
    /// should not brick a restore.
    pub fn import_state(&mut self, snapshot: HashMap<String, FanInState>) {
        for state in self.fan_in.values_mut() {
            *state = FanInState::default();
        }
        for (encoded, state) in snapshot {
            match self
                .fan_in
                .iter_mut()
                .find(|(connection, _)| connection.encode() == encoded)
            {
                Some((_, slot)) => *slot = state,
                None => {
                    warn!(connection = %encoded, "fan-in state for unknown connection; skipping")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::types::{ExecutorIdentity, PortableValue, RequestId};

    fn text_from(id: &str, s: &str) -> MessageEnvelope {
        MessageEnvelope::new(
            PortableValue::from_typed("text", &s.to_string()).unwrap(),
            ExecutorIdentity::executor(id),
        )
    }

    fn sample_map() -> EdgeMap {
        let edges = vec![
            Edge::direct("start", "a"),
            Edge::direct("start", "b"),
            Edge::fan_in(vec![ExecutorId::new("a"), ExecutorId::new("b")], "join"),
        ];
        EdgeMap::new(
            ExecutorId::new("start"),
            &edges,
            vec![(PortId::new("approval"), ExecutorId::new("join"))],
        )
    }

    #[test]
    fn test_input_routes_to_start() {
        let map = sample_map();
        let delivery = map.invoke_input(&MessageEnvelope::external(
            PortableValue::from_typed("text", &"in".to_string()).unwrap(),
        ));
        assert_eq!(delivery.target, ExecutorId::new("start"));
    }

    #[test]
    fn test_edges_fan_in_holds_until_complete() {
        let mut map = sample_map();

        let from_a = map
            .invoke_edges(&ExecutorId::new("a"), &text_from("a", "left"))
            .unwrap();
        assert!(from_a.is_empty());

        let from_b = map
            .invoke_edges(&ExecutorId::new("b"), &text_from("b", "right"))
            .unwrap();
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_b[0].target, ExecutorId::new("join"));
    }

    #[test]
    fn test_unknown_port_is_fatal() {
        let map = sample_map();
        let response = ExternalResponse {
            port_id: PortId::new("nonexistent"),
            request_id: RequestId::new(),
            payload: PortableValue::from_typed("text", &"x".to_string()).unwrap(),
        };
        let err = map.invoke_response(&response).unwrap_err();
        assert!(matches!(err, StrandError::UnknownPort(_)));
    }

    #[test]
    fn test_response_routes_to_bound_executor() {
        let map = sample_map();
        let response = ExternalResponse {
            port_id: PortId::new("approval"),
            request_id: RequestId::new(),
            payload: PortableValue::from_typed("text", &"ok".to_string()).unwrap(),
        };
        let delivery = map.invoke_response(&response).unwrap();
        assert_eq!(delivery.target, ExecutorId::new("join"));
        assert_eq!(delivery.envelope.source, ExecutorIdentity::External);
    }

    #[test]
    fn test_export_import_restores_partial_fan_in() {
        let mut map = sample_map();
        map.invoke_edges(&ExecutorId::new("a"), &text_from("a", "left"))
            .unwrap();

        let snapshot = map.export_state();

        // Fresh map from the same topology resumes the partial accumulation.
        let mut restored = sample_map();
        restored.import_state(snapshot);
        let deliveries = restored
            .invoke_edges(&ExecutorId::new("b"), &text_from("b", "right"))
            .unwrap();
        assert_eq!(deliveries.len(), 1, "restored state completes the barrier");
    }

    #[test]
    fn test_import_skips_unknown_connection() {
        let mut map = sample_map();
        let mut snapshot = HashMap::new();
        snapshot.insert("ghost->nowhere".to_string(), FanInState::default());
        // Must not panic or error; the entry is dropped.
        map.import_state(snapshot);
    }

    #[test]
    fn test_no_edges_drops_message() {
        let mut map = sample_map();
        let deliveries = map
            .invoke_edges(&ExecutorId::new("join"), &text_from("join", "done"))
            .unwrap();
        assert!(deliveries.is_empty());
    }
}
