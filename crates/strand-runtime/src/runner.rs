use std::sync::Arc;

use futures::future;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strand_core::config::{ExecutionStrategy, RuntimeConfig};
use strand_core::error::{Result, StrandError};
use strand_core::event::RunEvent;
use strand_core::types::{ExecutorIdentity, ExternalResponse, MessageEnvelope, PortableValue};
use strand_graph::runner::EdgeDelivery;
use strand_graph::EdgeMap;

use crate::context::RunnerContext;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no super-step executed yet.
    NotStarted,
    /// Messages are queued for the next super-step.
    Running,
    /// No queued messages and no outstanding requests; new input can wake
    /// the run.
    Idle,
    /// No queued messages but external requests await responses.
    PendingRequests,
    /// Halted by a `HaltRequested` event; terminal.
    Ended,
    /// Cancelled via the run handle; terminal.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Ended | RunStatus::Cancelled)
    }
}

/// Drives a workflow one super-step at a time.
///
/// Each call to [`run_super_step`](SuperStepRunner::run_super_step) swaps in
/// the queues accumulated during the previous step, routes every envelope
/// through the edge map, and dispatches the resulting deliveries under the
/// configured execution strategy. Messages produced while dispatching land
/// in the next step's queues, never the current one.
pub struct SuperStepRunner {
    pub(crate) edge_map: EdgeMap,
    pub(crate) ctx: Arc<RunnerContext>,
    pub(crate) status: RunStatus,
    pub(crate) step: u64,
    config: RuntimeConfig,
    cancel: CancellationToken,
}

impl SuperStepRunner {
    pub fn new(
        edge_map: EdgeMap,
        ctx: Arc<RunnerContext>,
        config: RuntimeConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            edge_map,
            ctx,
            status: RunStatus::NotStarted,
            step: 0,
            config,
            cancel,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn context(&self) -> &Arc<RunnerContext> {
        &self.ctx
    }

    /// Queue run input: routed along the entry edge to the start executor,
    /// visible from the next super-step.
    pub fn enqueue_input(&mut self, input: PortableValue) {
        let delivery = self.edge_map.invoke_input(&MessageEnvelope::external(input));
        self.ctx
            .send_message(ExecutorIdentity::External, delivery.envelope);
        self.refresh_status();
    }

    /// Queue an external response for delivery to the executor bound to its
    /// port. The port is resolved before the request is consumed, so a bad
    /// response leaves the outstanding table untouched.
    pub fn enqueue_response(&mut self, response: &ExternalResponse) -> Result<()> {
        let delivery = self.edge_map.invoke_response(response)?;
        if !self.ctx.complete_request(&response.request_id) {
            return Err(StrandError::UnknownRequest(response.request_id.to_string()));
        }
        self.ctx
            .send_message(ExecutorIdentity::External, delivery.envelope);
        self.refresh_status();
        Ok(())
    }

    /// Recompute the status from the queue and request tables. Terminal
    /// states are sticky.
    pub fn refresh_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        if self.ctx.halt_requested() {
            self.status = RunStatus::Ended;
        } else if self.cancel.is_cancelled() {
            self.status = RunStatus::Cancelled;
        } else if self.ctx.has_queued_messages() {
            self.status = RunStatus::Running;
        } else if self.ctx.has_outstanding_requests() {
            self.status = RunStatus::PendingRequests;
        } else if self.status != RunStatus::NotStarted {
            self.status = RunStatus::Idle;
        }
    }

    /// Execute one super-step over the currently queued messages.
    pub async fn run_super_step(&mut self) -> Result<()> {
        if self.ctx.halt_requested() {
            self.status = RunStatus::Ended;
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            self.status = RunStatus::Cancelled;
            return Ok(());
        }
        if let Some(max) = self.config.max_supersteps {
            if self.step >= max {
                return Err(StrandError::MaxStepsExceeded(max));
            }
        }

        self.step += 1;
        self.status = RunStatus::Running;
        let queues = self.ctx.advance();
        debug!(step = self.step, messages = queues.message_count(), "super-step started");

        // Route first, then dispatch: fan-in accumulation must observe every
        // contribution from this step before any executor runs.
        let mut deliveries: Vec<EdgeDelivery> = Vec::new();
        for (sender, envelopes) in queues.drain() {
            for envelope in envelopes {
                if let Some(target) = envelope.target.clone() {
                    deliveries.push(EdgeDelivery { target, envelope });
                    continue;
                }
                match &sender {
                    ExecutorIdentity::External => {
                        deliveries.push(self.edge_map.invoke_input(&envelope));
                    }
                    ExecutorIdentity::Executor { id } => {
                        deliveries.extend(self.edge_map.invoke_edges(id, &envelope)?);
                    }
                }
            }
        }

        match self.config.strategy {
            ExecutionStrategy::Lockstep => {
                for delivery in deliveries {
                    if self.ctx.halt_requested() || self.cancel.is_cancelled() {
                        break;
                    }
                    dispatch(self.ctx.clone(), self.cancel.clone(), delivery).await?;
                }
            }
            ExecutionStrategy::Concurrent => {
                let handles = deliveries
                    .into_iter()
                    .map(|delivery| dispatch(self.ctx.clone(), self.cancel.clone(), delivery));
                for outcome in future::join_all(handles).await {
                    outcome?;
                }
            }
        }

        self.ctx
            .push_event(RunEvent::SuperStepCompleted { step: self.step });
        self.refresh_status();
        info!(step = self.step, status = ?self.status, "super-step completed");
        Ok(())
    }
}

/// Deliver one envelope to its target executor.
///
/// Emissions buffered during the invocation are committed only on success;
/// a failing executor leaves no messages, events, or requests behind. A halt
/// or cancellation raised while concurrent peers are in flight skips
/// deliveries that have not started and drops outcomes that land afterwards,
/// matching the lockstep short-circuit.
async fn dispatch(
    ctx: Arc<RunnerContext>,
    cancel: CancellationToken,
    delivery: EdgeDelivery,
) -> Result<()> {
    if ctx.halt_requested() || cancel.is_cancelled() {
        return Ok(());
    }
    let EdgeDelivery { target, envelope } = delivery;
    let executor = ctx.ensure_executor(&target).await?;

    let message_tag = envelope.message.type_tag().to_string();
    if !executor.routes().accepts(&message_tag) {
        return Err(StrandError::UnroutedMessage {
            executor: target.to_string(),
            type_tag: message_tag,
        });
    }

    ctx.push_event(RunEvent::ExecutorInvoked {
        executor_id: target.clone(),
        message_tag,
    });

    let bound = ctx.bind(target.clone());
    match executor.handle(envelope, &bound).await {
        Ok(result) => {
            if ctx.halt_requested() || cancel.is_cancelled() {
                bound.discard();
                return Ok(());
            }
            bound.commit();
            if let Some(value) = result.clone() {
                let sender = ExecutorIdentity::executor(target.clone());
                ctx.send_message(sender.clone(), MessageEnvelope::new(value, sender));
            }
            ctx.push_event(RunEvent::ExecutorCompleted {
                executor_id: target,
                result,
            });
            Ok(())
        }
        Err(error) => {
            bound.discard();
            Err(StrandError::Executor {
                executor: target.to_string(),
                message: error.to_string(),
            })
        }
    }
}
