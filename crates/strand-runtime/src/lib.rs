//! Super-step execution runtime for Strand workflows.
//!
//! A run advances in discrete super-steps: messages produced while one step
//! executes are queued and become visible only after the step's barrier.
//! Progress is pull-driven through the run's [`EventStream`]; nothing
//! executes between `next()` calls, which is what makes a resting run safe
//! to checkpoint with [`RunHandle::export_checkpoint`] and resume later.

pub mod context;
pub mod run;
pub mod runner;
pub mod snapshot;
pub mod state;
pub mod step;

pub use context::{BoundContext, RunnerContext};
pub use run::{resume, start, EventStream, RunHandle};
pub use runner::{RunStatus, SuperStepRunner};
pub use snapshot::{RunSnapshot, SNAPSHOT_VERSION};
pub use state::{ScopeKeyedStateManager, StateSnapshot};
pub use step::{QueuedMessages, StepContext};
