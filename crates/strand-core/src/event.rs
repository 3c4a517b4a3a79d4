use serde::{Deserialize, Serialize};

use crate::types::{ExecutorId, ExternalRequest, PortableValue};

/// An observable event emitted while a run is executing.
///
/// Events surface to the run's event stream in emission order.
/// `HaltRequested` is reserved: the stream intercepts it and terminates the
/// run instead of surfacing it to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// An executor started processing a delivered message.
    ExecutorInvoked {
        executor_id: ExecutorId,
        message_tag: String,
    },

    /// An executor finished processing, with its optional result value.
    ExecutorCompleted {
        executor_id: ExecutorId,
        result: Option<PortableValue>,
    },

    /// An incremental update yielded by an executor mid-invocation.
    ExecutorUpdate {
        executor_id: ExecutorId,
        update: PortableValue,
    },

    /// A custom event added by an executor through its bound context.
    Custom {
        executor_id: ExecutorId,
        name: String,
        data: PortableValue,
    },

    /// An external request was posted through a port.
    ///
    /// Republished after a checkpoint restore so a resumed caller can
    /// discover what is still pending.
    RequestPosted { request: ExternalRequest },

    /// One super-step finished processing.
    SuperStepCompleted { step: u64 },

    /// Halt signal. Intercepted by the event stream, never surfaced.
    HaltRequested,
}

impl RunEvent {
    pub fn is_halt(&self) -> bool {
        matches!(self, RunEvent::HaltRequested)
    }
}
