use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::error::Result;
use strand_core::traits::Executor;
use strand_core::types::{ExecutorId, PortId, RequestPort};

use crate::edge::Edge;
use crate::edge_map::EdgeMap;

/// Zero-arg async constructor for an executor, invoked lazily on first
/// delivery (and eagerly on checkpoint restore).
pub type ExecutorFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Executor>>> + Send + Sync>;

/// A port declaration together with the executor that owns it.
#[derive(Debug, Clone)]
pub struct PortBinding {
    pub executor_id: ExecutorId,
    pub port: RequestPort,
}

/// A built workflow graph: the designated start executor, the full edge set,
/// the port bindings, and the executor registration table.
///
/// The workflow itself is immutable; all run state lives in the runtime.
pub struct Workflow {
    start: ExecutorId,
    edges: Vec<Edge>,
    ports: HashMap<PortId, PortBinding>,
    registrations: HashMap<ExecutorId, ExecutorFactory>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("start", &self.start)
            .field("edges", &self.edges)
            .field("ports", &self.ports)
            .field(
                "registrations",
                &self.registrations.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Workflow {
    pub(crate) fn new(
        start: ExecutorId,
        edges: Vec<Edge>,
        ports: HashMap<PortId, PortBinding>,
        registrations: HashMap<ExecutorId, ExecutorFactory>,
    ) -> Self {
        Self {
            start,
            edges,
            ports,
            registrations,
        }
    }

    pub fn start_executor_id(&self) -> &ExecutorId {
        &self.start
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges listening on the given source id.
    pub fn edges_from<'a>(&'a self, source: &'a ExecutorId) -> impl Iterator<Item = &'a Edge> {
        self.edges
            .iter()
            .filter(move |edge| edge.sources().contains(&source))
    }

    pub fn ports(&self) -> &HashMap<PortId, PortBinding> {
        &self.ports
    }

    pub fn registrations(&self) -> &HashMap<ExecutorId, ExecutorFactory> {
        &self.registrations
    }

    pub fn factory(&self, id: &ExecutorId) -> Option<&ExecutorFactory> {
        self.registrations.get(id)
    }

    /// Construct the routing table for a run of this workflow.
    pub fn edge_map(&self) -> EdgeMap {
        EdgeMap::new(
            self.start.clone(),
            &self.edges,
            self.ports
                .iter()
                .map(|(id, binding)| (id.clone(), binding.executor_id.clone())),
        )
    }
}
