use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::event::RunEvent;
use strand_core::traits::{Executor, WorkflowContext};
use strand_core::types::{
    ExecutorId, ExecutorIdentity, ExternalRequest, MessageEnvelope, PortableValue, RequestId,
    RequestPort, ScopeKey,
};
use strand_graph::ExecutorFactory;

use crate::state::ScopeKeyedStateManager;
use crate::step::{QueuedMessages, StepContext};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared run-scoped services: lazy executor instantiation, the next-step
/// message accumulator, outstanding external requests, the event queue, and
/// the durable state manager.
///
/// One instance lives for the run; executors see it only through a
/// [`BoundContext`] scoped to their id and invocation.
pub struct RunnerContext {
    registrations: HashMap<ExecutorId, ExecutorFactory>,
    executors: Mutex<HashMap<ExecutorId, Arc<dyn Executor>>>,
    next_step: Mutex<StepContext>,
    outstanding: Mutex<HashMap<RequestId, ExternalRequest>>,
    events: Mutex<VecDeque<RunEvent>>,
    halt: AtomicBool,
    state: ScopeKeyedStateManager,
}

impl RunnerContext {
    pub fn new(registrations: HashMap<ExecutorId, ExecutorFactory>) -> Self {
        Self {
            registrations,
            executors: Mutex::new(HashMap::new()),
            next_step: Mutex::new(StepContext::new()),
            outstanding: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            halt: AtomicBool::new(false),
            state: ScopeKeyedStateManager::new(),
        }
    }

    pub fn state(&self) -> &ScopeKeyedStateManager {
        &self.state
    }

    /// Return the live executor for `id`, materializing it from its
    /// registered factory on first use.
    pub async fn ensure_executor(&self, id: &ExecutorId) -> Result<Arc<dyn Executor>> {
        if let Some(executor) = lock(&self.executors).get(id) {
            return Ok(executor.clone());
        }

        let factory = self
            .registrations
            .get(id)
            .ok_or_else(|| StrandError::UnknownExecutor(id.to_string()))?
            .clone();
        let executor = factory().await?;
        debug!(executor = %id, "executor instantiated");

        // Two tasks can race here under the concurrent strategy; first
        // insert wins so both see the same instance afterwards.
        let mut executors = lock(&self.executors);
        Ok(executors
            .entry(id.clone())
            .or_insert(executor)
            .clone())
    }

    /// Queue a message for the next super-step.
    pub fn send_message(&self, sender: ExecutorIdentity, envelope: MessageEnvelope) {
        lock(&self.next_step).push(sender, envelope);
    }

    /// Swap in a fresh accumulator and return the queues for the step that
    /// is about to execute. This is the super-step visibility barrier.
    pub fn advance(&self) -> StepContext {
        std::mem::take(&mut *lock(&self.next_step))
    }

    pub fn has_queued_messages(&self) -> bool {
        !lock(&self.next_step).is_empty()
    }

    pub fn track_request(&self, request: ExternalRequest) {
        lock(&self.outstanding).insert(request.request_id.clone(), request);
    }

    /// Remove a resolved request. Returns `false` for an unknown id.
    pub fn complete_request(&self, request_id: &RequestId) -> bool {
        lock(&self.outstanding).remove(request_id).is_some()
    }

    pub fn has_outstanding_requests(&self) -> bool {
        !lock(&self.outstanding).is_empty()
    }

    /// Outstanding requests sorted by id, for deterministic checkpoints.
    pub fn outstanding_requests(&self) -> Vec<ExternalRequest> {
        let mut requests: Vec<ExternalRequest> =
            lock(&self.outstanding).values().cloned().collect();
        requests.sort_by(|a, b| a.request_id.0.cmp(&b.request_id.0));
        requests
    }

    /// Ids of every executor materialized so far, sorted.
    pub fn instantiated(&self) -> Vec<ExecutorId> {
        let mut ids: Vec<ExecutorId> = lock(&self.executors).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn push_event(&self, event: RunEvent) {
        if event.is_halt() {
            self.halt.store(true, Ordering::SeqCst);
        }
        lock(&self.events).push_back(event);
    }

    pub fn pop_event(&self) -> Option<RunEvent> {
        lock(&self.events).pop_front()
    }

    pub fn has_pending_events(&self) -> bool {
        !lock(&self.events).is_empty()
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Snapshot the queued next-step messages (checkpoint export).
    pub fn export_next_step(&self) -> Vec<QueuedMessages> {
        lock(&self.next_step).export()
    }

    /// Replace the next-step queues wholesale (checkpoint import).
    pub fn replace_next_step(&self, step: StepContext) {
        *lock(&self.next_step) = step;
    }

    /// Replace the outstanding-request table wholesale (checkpoint import).
    pub fn replace_outstanding(&self, requests: Vec<ExternalRequest>) {
        *lock(&self.outstanding) = requests
            .into_iter()
            .map(|request| (request.request_id.clone(), request))
            .collect();
    }

    /// Bind a per-invocation context for the given executor.
    pub fn bind(self: &Arc<Self>, executor_id: ExecutorId) -> BoundContext {
        BoundContext {
            runner: self.clone(),
            executor_id,
            pending: Mutex::new(PendingEmissions::default()),
        }
    }
}

#[derive(Default)]
struct PendingEmissions {
    events: Vec<RunEvent>,
    messages: Vec<(PortableValue, Option<ExecutorId>)>,
    requests: Vec<ExternalRequest>,
}

/// The [`WorkflowContext`] handed to one executor invocation.
///
/// Events, messages, and requests are buffered here and flushed by
/// [`commit`](BoundContext::commit) only when the invocation returns `Ok`; a
/// failed invocation leaves no partial emissions behind. State operations
/// bypass the buffer and hit the state manager directly.
pub struct BoundContext {
    runner: Arc<RunnerContext>,
    executor_id: ExecutorId,
    pending: Mutex<PendingEmissions>,
}

impl BoundContext {
    /// Flush buffered emissions into the run: events to the stream, messages
    /// to the next step, requests to the outstanding table (each with a
    /// `RequestPosted` event).
    pub fn commit(self) {
        let pending = self.pending.into_inner().unwrap_or_else(|e| e.into_inner());
        let sender = ExecutorIdentity::executor(self.executor_id.clone());

        for event in pending.events {
            self.runner.push_event(event);
        }
        for (message, target) in pending.messages {
            let mut envelope = MessageEnvelope::new(message, sender.clone());
            if let Some(target) = target {
                envelope = envelope.with_target(target);
            }
            self.runner.send_message(sender.clone(), envelope);
        }
        for request in pending.requests {
            self.runner.push_event(RunEvent::RequestPosted {
                request: request.clone(),
            });
            self.runner.track_request(request);
        }
    }

    /// Drop buffered emissions after a failed invocation.
    pub fn discard(self) {
        let pending = lock(&self.pending);
        debug!(
            executor = %self.executor_id,
            events = pending.events.len(),
            messages = pending.messages.len(),
            requests = pending.requests.len(),
            "discarding emissions from failed invocation"
        );
    }
}

impl WorkflowContext for BoundContext {
    fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    fn add_event(&self, event: RunEvent) {
        lock(&self.pending).events.push(event);
    }

    fn send_message(&self, message: PortableValue, target: Option<ExecutorId>) {
        lock(&self.pending).messages.push((message, target));
    }

    fn post_request(&self, port: RequestPort, payload: PortableValue) -> RequestId {
        let request = ExternalRequest::new(port, payload);
        let id = request.request_id.clone();
        lock(&self.pending).requests.push(request);
        id
    }

    fn read_state(&self, key: &str, scope: Option<&str>) -> Result<Option<PortableValue>> {
        let scope_key = self.scope_key(key, scope);
        Ok(self.runner.state.read(&scope_key))
    }

    fn queue_state_update(
        &self,
        key: &str,
        scope: Option<&str>,
        value: Option<PortableValue>,
    ) -> Result<()> {
        let scope_key = self.scope_key(key, scope);
        self.runner.state.write(&scope_key, value)
    }

    fn queue_clear_scope(&self, scope: Option<&str>) -> Result<()> {
        self.runner.state.clear(&self.executor_id, scope);
        Ok(())
    }

    fn read_state_keys(&self, scope: Option<&str>) -> Result<BTreeSet<String>> {
        Ok(self.runner.state.read_keys(&self.executor_id, scope))
    }
}

impl BoundContext {
    fn scope_key(&self, key: &str, scope: Option<&str>) -> ScopeKey {
        ScopeKey {
            executor_id: self.executor_id.clone(),
            scope: scope.map(str::to_string),
            key: key.to_string(),
        }
    }
}
