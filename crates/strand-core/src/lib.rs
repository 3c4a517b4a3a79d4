pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::{ExecutionStrategy, RuntimeConfig};
pub use error::{Result, StrandError};
pub use event::RunEvent;
pub use traits::{Executor, FnExecutor, RouteTable, WorkflowContext, WorkflowContextExt};
pub use types::*;
