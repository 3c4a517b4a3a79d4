use std::collections::{BTreeSet, HashSet};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::event::RunEvent;
use crate::types::{ExecutorId, MessageEnvelope, PortableValue, RequestId, RequestPort};

/// The message types an executor accepts, declared at construction.
///
/// Delivery of a message whose type tag has no entry is a fatal routing
/// error — the runtime checks the table before invoking the executor.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    tags: HashSet<String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handled message type tag.
    pub fn route(mut self, type_tag: impl Into<String>) -> Self {
        self.tags.insert(type_tag.into());
        self
    }

    pub fn accepts(&self, type_tag: &str) -> bool {
        self.tags.contains(type_tag)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// The context surface an executor sees while processing one message.
///
/// Emitted events, messages, and requests are buffered per invocation and
/// flushed only if the invocation succeeds; state reads and writes go
/// straight to the durable state manager.
pub trait WorkflowContext: Send + Sync {
    /// The executor this context is bound to.
    fn executor_id(&self) -> &ExecutorId;

    /// Emit an event to the run's event stream.
    fn add_event(&self, event: RunEvent);

    /// Send a message, visible from the next super-step. `None` target means
    /// "route along my outgoing edges".
    fn send_message(&self, message: PortableValue, target: Option<ExecutorId>);

    /// Post an external request through a port, suspending this branch until
    /// a matching response arrives.
    fn post_request(&self, port: RequestPort, payload: PortableValue) -> RequestId;

    /// Read a state value. A missing key reads as `None`, never an error.
    fn read_state(&self, key: &str, scope: Option<&str>) -> Result<Option<PortableValue>>;

    /// Write a state value (`None` clears the key). Fails fast on a
    /// shared-scope single-writer conflict.
    fn queue_state_update(
        &self,
        key: &str,
        scope: Option<&str>,
        value: Option<PortableValue>,
    ) -> Result<()>;

    /// Clear every key this executor holds in the given scope.
    fn queue_clear_scope(&self, scope: Option<&str>) -> Result<()>;

    /// List the keys this executor holds in the given scope.
    fn read_state_keys(&self, scope: Option<&str>) -> Result<BTreeSet<String>>;
}

/// Typed conveniences over the object-safe [`WorkflowContext`] surface.
pub trait WorkflowContextExt: WorkflowContext {
    fn read_typed<T: DeserializeOwned>(&self, key: &str, scope: Option<&str>) -> Result<Option<T>> {
        match self.read_state(key, scope)? {
            Some(value) => Ok(Some(value.materialize()?)),
            None => Ok(None),
        }
    }

    fn write_typed<T: Serialize>(
        &self,
        key: &str,
        scope: Option<&str>,
        type_tag: &str,
        value: &T,
    ) -> Result<()> {
        let portable = PortableValue::from_typed(type_tag, value)?;
        self.queue_state_update(key, scope, Some(portable))
    }
}

impl<W: WorkflowContext + ?Sized> WorkflowContextExt for W {}

/// A stateful graph node: processes one typed message against a bound
/// context and produces an optional result value.
///
/// Executors are materialized lazily by id on first delivery and live for
/// the run's lifetime. Their durable state lives in the state manager, not
/// in the executor itself, so identity survives checkpoint restore.
pub trait Executor: Send + Sync + 'static {
    fn id(&self) -> &ExecutorId;

    /// The message types this executor handles.
    fn routes(&self) -> &RouteTable;

    /// Process one delivered message. The returned value, if any, is routed
    /// along the executor's outgoing edges in the next super-step.
    fn handle<'a>(
        &'a self,
        envelope: MessageEnvelope,
        ctx: &'a dyn WorkflowContext,
    ) -> BoxFuture<'a, Result<Option<PortableValue>>>;

    /// Called before a checkpoint export so the executor can flush derived
    /// in-memory state into the durable state manager.
    fn on_checkpointing<'a>(&'a self, ctx: &'a dyn WorkflowContext) -> BoxFuture<'a, Result<()>> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }

    /// Called after this executor is re-materialized from a checkpoint,
    /// before any queued message is replayed to it.
    fn on_checkpoint_restored<'a>(
        &'a self,
        ctx: &'a dyn WorkflowContext,
    ) -> BoxFuture<'a, Result<()>> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }
}

impl std::fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("id", self.id()).finish()
    }
}

type HandlerFn = dyn for<'a> Fn(
        MessageEnvelope,
        &'a dyn WorkflowContext,
    ) -> BoxFuture<'a, Result<Option<PortableValue>>>
    + Send
    + Sync;

/// Closure-backed [`Executor`] for nodes that don't need a bespoke struct.
pub struct FnExecutor {
    id: ExecutorId,
    routes: RouteTable,
    handler: Box<HandlerFn>,
}

impl FnExecutor {
    pub fn new<F>(id: impl Into<ExecutorId>, routes: RouteTable, handler: F) -> Self
    where
        F: for<'a> Fn(
                MessageEnvelope,
                &'a dyn WorkflowContext,
            ) -> BoxFuture<'a, Result<Option<PortableValue>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            routes,
            handler: Box::new(handler),
        }
    }
}

impl Executor for FnExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn handle<'a>(
        &'a self,
        envelope: MessageEnvelope,
        ctx: &'a dyn WorkflowContext,
    ) -> BoxFuture<'a, Result<Option<PortableValue>>> {
        (self.handler)(envelope, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table() {
        let routes = RouteTable::new().route("text").route("strand.fan_in");
        assert!(routes.accepts("text"));
        assert!(routes.accepts("strand.fan_in"));
        assert!(!routes.accepts("binary"));
    }

    #[test]
    fn test_fn_executor_declares_routes() {
        let executor = FnExecutor::new("upper", RouteTable::new().route("text"), |_envelope, _ctx| {
            Box::pin(async { Ok(None) })
        });
        assert_eq!(executor.id().as_str(), "upper");
        assert!(executor.routes().accepts("text"));
    }
}
