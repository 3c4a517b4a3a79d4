use std::collections::HashMap;
use std::sync::Arc;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Executor;
use strand_core::types::{ExecutorId, RequestPort};

use crate::edge::{Edge, EdgePredicate, FanOutTarget};
use crate::workflow::{ExecutorFactory, PortBinding, Workflow};

/// Builds a [`Workflow`] from node registrations, edges, and ports.
///
/// Consumed by the declarative-model compiler; validation happens once at
/// `build()` so partially-specified graphs can be assembled in any order.
pub struct WorkflowBuilder {
    start: ExecutorId,
    registrations: HashMap<ExecutorId, ExecutorFactory>,
    edges: Vec<Edge>,
    ports: Vec<PortBinding>,
    duplicate_ids: Vec<ExecutorId>,
}

impl WorkflowBuilder {
    /// Start a new graph whose entry edge delivers run input to `start`.
    pub fn new(start: impl Into<ExecutorId>) -> Self {
        Self {
            start: start.into(),
            registrations: HashMap::new(),
            edges: Vec::new(),
            ports: Vec::new(),
            duplicate_ids: Vec::new(),
        }
    }

    /// Register a node by async factory. With a `parent`, also adds a Direct
    /// edge from the parent, optionally gated by an `on_complete` predicate.
    pub fn add_node(
        mut self,
        id: impl Into<ExecutorId>,
        factory: ExecutorFactory,
        parent: Option<&ExecutorId>,
        on_complete: Option<EdgePredicate>,
    ) -> Self {
        let id = id.into();
        if self.registrations.insert(id.clone(), factory).is_some() {
            self.duplicate_ids.push(id.clone());
        }
        if let Some(parent) = parent {
            self.edges.push(Edge::Direct {
                source: parent.clone(),
                target: id,
                predicate: on_complete,
            });
        }
        self
    }

    /// Register an already-constructed executor (shared across the run).
    pub fn add_executor(self, executor: Arc<dyn Executor>) -> Self {
        let id = executor.id().clone();
        let factory: ExecutorFactory = Arc::new(move || {
            let executor = executor.clone();
            Box::pin(async move { Ok(executor) })
        });
        self.add_node(id, factory, None, None)
    }

    /// Add a Direct edge, optionally gated by a predicate.
    pub fn add_link(
        mut self,
        from: impl Into<ExecutorId>,
        to: impl Into<ExecutorId>,
        predicate: Option<EdgePredicate>,
    ) -> Self {
        self.edges.push(Edge::Direct {
            source: from.into(),
            target: to.into(),
            predicate,
        });
        self
    }

    /// Add a fan-out edge from one source to many targets, each with its own
    /// optional predicate.
    pub fn add_fan_out(mut self, source: impl Into<ExecutorId>, targets: Vec<FanOutTarget>) -> Self {
        self.edges.push(Edge::fan_out(source, targets));
        self
    }

    /// Add a fan-in synchronization edge from many named sources to one sink.
    pub fn add_fan_in(mut self, sources: Vec<ExecutorId>, sink: impl Into<ExecutorId>) -> Self {
        self.edges.push(Edge::fan_in(sources, sink));
        self
    }

    /// Declare an external-request port owned by `owner`.
    pub fn add_port(mut self, port: RequestPort, owner: impl Into<ExecutorId>) -> Self {
        self.ports.push(PortBinding {
            executor_id: owner.into(),
            port,
        });
        self
    }

    /// Validate and build the workflow.
    pub fn build(self) -> Result<Workflow> {
        if let Some(id) = self.duplicate_ids.first() {
            return Err(StrandError::GraphBuild(format!(
                "executor id '{}' registered more than once",
                id
            )));
        }
        if !self.registrations.contains_key(&self.start) {
            return Err(StrandError::GraphBuild(format!(
                "start executor '{}' is not registered",
                self.start
            )));
        }

        for edge in &self.edges {
            for endpoint in edge.sources().into_iter().chain(edge.sinks()) {
                if !self.registrations.contains_key(endpoint) {
                    return Err(StrandError::GraphBuild(format!(
                        "edge {} references unregistered executor '{}'",
                        edge.connection(),
                        endpoint
                    )));
                }
            }
            if let Edge::FanIn { sources, .. } = edge {
                if sources.is_empty() {
                    return Err(StrandError::GraphBuild(
                        "fan-in edge requires at least one source".to_string(),
                    ));
                }
            }
        }

        let mut ports = HashMap::new();
        for binding in self.ports {
            if !self.registrations.contains_key(&binding.executor_id) {
                return Err(StrandError::GraphBuild(format!(
                    "port '{}' bound to unregistered executor '{}'",
                    binding.port.id, binding.executor_id
                )));
            }
            let port_id = binding.port.id.clone();
            if ports.insert(port_id.clone(), binding).is_some() {
                return Err(StrandError::GraphBuild(format!(
                    "port id '{}' declared more than once",
                    port_id
                )));
            }
        }

        Ok(Workflow::new(
            self.start,
            self.edges,
            ports,
            self.registrations,
        ))
    }
}
