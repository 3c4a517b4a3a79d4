//! Edge topology and routing for Strand workflows.
//!
//! Edges come in three variants — Direct, FanOut, and FanIn — each with its
//! own runner and completion semantics. The [`EdgeMap`] owns the runners for
//! a run and routes messages and external responses to them.

pub mod builder;
pub mod edge;
pub mod edge_map;
pub mod runner;
pub mod workflow;

pub use builder::WorkflowBuilder;
pub use edge::{Connection, Edge, EdgePredicate, FanOutTarget};
pub use edge_map::EdgeMap;
pub use runner::{DirectEdgeRunner, EdgeDelivery, FanInEdgeRunner, FanInState, FanOutEdgeRunner};
pub use workflow::{ExecutorFactory, PortBinding, Workflow};
