use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strand_core::config::RuntimeConfig;
use strand_core::error::{Result, StrandError};
use strand_core::event::RunEvent;
use strand_core::types::{ExternalResponse, PortableValue, RunId};
use strand_graph::Workflow;

use crate::context::RunnerContext;
use crate::runner::{RunStatus, SuperStepRunner};
use crate::snapshot::{RunSnapshot, SNAPSHOT_VERSION};
use crate::step::StepContext;

struct RunInner {
    run_id: std::sync::Mutex<RunId>,
    config: RuntimeConfig,
    runner: tokio::sync::Mutex<SuperStepRunner>,
    wake: Notify,
    cancel: CancellationToken,
    stream_taken: AtomicBool,
}

/// Handle to an in-process workflow run.
///
/// Cheap to clone; all clones share the same run. Progress happens inside
/// [`EventStream::next`] — the run is pull-driven, nothing executes between
/// calls.
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<RunInner>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id())
            .finish()
    }
}

/// Start a new run with the given input queued for the first super-step.
pub fn start(workflow: &Workflow, input: PortableValue, config: RuntimeConfig) -> RunHandle {
    let handle = RunHandle::idle_with(workflow, config, Some(input));
    info!(run_id = %handle.run_id(), "run started");
    handle
}

/// Resume a run from a snapshot on a freshly built workflow graph.
///
/// The workflow must have the same executors, edges, and ports as the one
/// the snapshot was exported from.
pub async fn resume(
    workflow: &Workflow,
    snapshot: RunSnapshot,
    config: RuntimeConfig,
) -> Result<RunHandle> {
    let handle = RunHandle::idle_with(workflow, config, None);
    handle.import_checkpoint(snapshot).await?;
    info!(run_id = %handle.run_id(), "run resumed from snapshot");
    Ok(handle)
}

impl RunHandle {
    fn idle_with(workflow: &Workflow, config: RuntimeConfig, input: Option<PortableValue>) -> Self {
        let cancel = CancellationToken::new();
        let ctx = Arc::new(RunnerContext::new(workflow.registrations().clone()));
        let mut runner =
            SuperStepRunner::new(workflow.edge_map(), ctx, config.clone(), cancel.clone());
        if let Some(input) = input {
            runner.enqueue_input(input);
        }
        Self {
            inner: Arc::new(RunInner {
                run_id: std::sync::Mutex::new(RunId::new()),
                config,
                runner: tokio::sync::Mutex::new(runner),
                wake: Notify::new(),
                cancel,
                stream_taken: AtomicBool::new(false),
            }),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.inner
            .run_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn status(&self) -> RunStatus {
        let mut runner = self.inner.runner.lock().await;
        runner.refresh_status();
        runner.status()
    }

    /// Queue additional input; an idle run wakes and resumes processing.
    pub async fn send_input(&self, input: PortableValue) {
        self.inner.runner.lock().await.enqueue_input(input);
        self.inner.wake.notify_waiters();
    }

    /// Resolve an outstanding external request. Fails on an unknown port or
    /// request id without consuming anything.
    pub async fn send_response(&self, response: &ExternalResponse) -> Result<()> {
        self.inner.runner.lock().await.enqueue_response(response)?;
        self.inner.wake.notify_waiters();
        Ok(())
    }

    /// Ask the run to halt after the events queued so far are consumed.
    pub async fn request_halt(&self) {
        self.inner
            .runner
            .lock()
            .await
            .context()
            .push_event(RunEvent::HaltRequested);
        self.inner.wake.notify_waiters();
    }

    /// Cancel immediately. Terminal; queued messages are abandoned.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        self.inner.wake.notify_waiters();
    }

    /// Take the run's event stream. At most one stream may exist at a time;
    /// dropping it releases the claim.
    ///
    /// With `block_on_pending` the stream stays open while external requests
    /// are outstanding, polling for responses; without it the stream ends so
    /// the caller can checkpoint and resume later.
    pub fn watch_event_stream(&self, block_on_pending: bool) -> Result<EventStream> {
        if self
            .inner
            .stream_taken
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StrandError::StreamTaken);
        }
        Ok(EventStream {
            inner: self.inner.clone(),
            block_on_pending,
            finished: false,
        })
    }

    /// Export a resumable snapshot of the run.
    ///
    /// Precondition: every emitted event has been consumed, so no observable
    /// history is lost in the copy. Executors get their `on_checkpointing`
    /// hook first to flush derived state into the state manager.
    pub async fn export_checkpoint(&self) -> Result<RunSnapshot> {
        let runner = self.inner.runner.lock().await;
        let ctx = runner.context().clone();
        if ctx.has_pending_events() {
            return Err(StrandError::CheckpointPrecondition(
                "unconsumed events in the stream; drain them before exporting".to_string(),
            ));
        }

        for id in ctx.instantiated() {
            let executor = ctx.ensure_executor(&id).await?;
            let bound = ctx.bind(id);
            executor.on_checkpointing(&bound).await?;
            bound.commit();
        }

        let snapshot = RunSnapshot {
            version: SNAPSHOT_VERSION,
            run_id: self.run_id(),
            step: runner.step(),
            state: ctx.state().export(),
            edge_state: runner.edge_map.export_state(),
            queued: ctx.export_next_step(),
            outstanding: ctx.outstanding_requests(),
            instantiated: ctx.instantiated(),
        };
        debug!(
            run_id = %snapshot.run_id,
            step = snapshot.step,
            queued = snapshot.queued.len(),
            outstanding = snapshot.outstanding.len(),
            "checkpoint exported"
        );
        Ok(snapshot)
    }

    /// Replace this run's entire state from a snapshot.
    ///
    /// Restored executors are re-materialized eagerly and get their
    /// `on_checkpoint_restored` hook before any queued message is replayed.
    /// `RequestPosted` events are republished for every outstanding request
    /// so the consumer can rediscover what it owes responses for.
    pub async fn import_checkpoint(&self, snapshot: RunSnapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StrandError::Checkpoint(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let mut runner = self.inner.runner.lock().await;
        let ctx = runner.context().clone();
        if ctx.has_pending_events() {
            return Err(StrandError::CheckpointPrecondition(
                "unconsumed events in the stream; drain them before importing".to_string(),
            ));
        }

        if !snapshot.queued.is_empty() {
            warn!(
                queued = snapshot.queued.len(),
                "importing snapshot with queued messages; they replay next step"
            );
        }

        *self.inner.run_id.lock().unwrap_or_else(|e| e.into_inner()) =
            snapshot.run_id.clone();
        ctx.state().import(snapshot.state);
        runner.edge_map.import_state(snapshot.edge_state);
        ctx.replace_next_step(StepContext::import(snapshot.queued));
        ctx.replace_outstanding(snapshot.outstanding.clone());
        runner.step = snapshot.step;
        runner.status = RunStatus::NotStarted;

        // Restore hooks run before any replayed delivery can observe the
        // executor.
        for id in snapshot.instantiated {
            let executor = ctx.ensure_executor(&id).await?;
            let bound = ctx.bind(id);
            executor.on_checkpoint_restored(&bound).await?;
            bound.commit();
        }

        for request in snapshot.outstanding {
            ctx.push_event(RunEvent::RequestPosted { request });
        }

        runner.refresh_status();
        debug!(run_id = %snapshot.run_id, step = runner.step(), status = ?runner.status(), "checkpoint imported");
        drop(runner);
        self.inner.wake.notify_waiters();
        Ok(())
    }
}

/// Pull-based stream of [`RunEvent`]s that also drives the run forward.
///
/// Each `next()` surfaces the oldest unconsumed event, executing super-steps
/// on demand when the queue is empty and messages are waiting. `None` means
/// the run reached a resting state for this stream: idle, ended, cancelled,
/// or (in non-blocking mode) waiting on external responses.
pub struct EventStream {
    inner: Arc<RunInner>,
    block_on_pending: bool,
    finished: bool,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<Result<RunEvent>> {
        if self.finished {
            return None;
        }

        loop {
            let mut runner = self.inner.runner.lock().await;

            if let Some(event) = runner.context().pop_event() {
                if event.is_halt() {
                    runner.status = RunStatus::Ended;
                    self.finished = true;
                    return None;
                }
                return Some(Ok(event));
            }

            runner.refresh_status();
            match runner.status() {
                RunStatus::Running => {
                    if let Err(error) = runner.run_super_step().await {
                        self.finished = true;
                        return Some(Err(error));
                    }
                }
                RunStatus::PendingRequests => {
                    drop(runner);
                    if !self.block_on_pending {
                        // Resting point: the caller can checkpoint here and
                        // resume once responses exist.
                        self.finished = true;
                        return None;
                    }
                    // The bounded sleep covers a wake-up racing the lock
                    // release above.
                    let interval =
                        Duration::from_millis(self.inner.config.pending_poll_interval_ms);
                    tokio::select! {
                        _ = self.inner.wake.notified() => {}
                        _ = tokio::time::sleep(interval) => {}
                        _ = self.inner.cancel.cancelled() => {
                            self.finished = true;
                            return None;
                        }
                    }
                }
                RunStatus::NotStarted
                | RunStatus::Idle
                | RunStatus::Ended
                | RunStatus::Cancelled => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.inner.stream_taken.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use strand_core::traits::{Executor, FnExecutor, RouteTable, WorkflowContext};
    use strand_core::types::{ExecutorId, PortableValue, RequestPort};
    use strand_graph::WorkflowBuilder;

    fn text(s: &str) -> PortableValue {
        PortableValue::from_typed("text", &s.to_string()).unwrap()
    }

    fn upper() -> Arc<dyn Executor> {
        Arc::new(FnExecutor::new(
            "upper",
            RouteTable::new().route("text"),
            |envelope, _ctx| {
                Box::pin(async move {
                    let s: String = envelope.message.materialize()?;
                    Ok(Some(PortableValue::from_typed("text", &s.to_uppercase())?))
                })
            },
        ))
    }

    fn reverse() -> Arc<dyn Executor> {
        Arc::new(FnExecutor::new(
            "reverse",
            RouteTable::new().route("text"),
            |envelope, _ctx| {
                Box::pin(async move {
                    let s: String = envelope.message.materialize()?;
                    let reversed: String = s.chars().rev().collect();
                    Ok(Some(PortableValue::from_typed("text", &reversed)?))
                })
            },
        ))
    }

    fn pipeline() -> strand_graph::Workflow {
        WorkflowBuilder::new("upper")
            .add_executor(upper())
            .add_executor(reverse())
            .add_link("upper", "reverse", None)
            .build()
            .unwrap()
    }

    async fn collect_outputs(stream: &mut EventStream) -> Vec<String> {
        let mut outputs = Vec::new();
        while let Some(event) = stream.next().await {
            if let RunEvent::ExecutorCompleted {
                result: Some(value),
                ..
            } = event.unwrap()
            {
                outputs.push(value.materialize().unwrap());
            }
        }
        outputs
    }

    #[tokio::test]
    async fn test_stream_drives_run_to_idle() {
        let workflow = pipeline();
        let handle = start(&workflow, text("Hello, World!"), RuntimeConfig::default());
        let mut stream = handle.watch_event_stream(false).unwrap();

        let outputs = collect_outputs(&mut stream).await;
        assert_eq!(
            outputs,
            vec!["HELLO, WORLD!".to_string(), "!DLROW ,OLLEH".to_string()]
        );
        assert_eq!(handle.status().await, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_stream_is_exclusive() {
        let workflow = pipeline();
        let handle = start(&workflow, text("x"), RuntimeConfig::default());

        let stream = handle.watch_event_stream(false).unwrap();
        assert!(matches!(
            handle.watch_event_stream(false),
            Err(StrandError::StreamTaken)
        ));

        drop(stream);
        assert!(handle.watch_event_stream(false).is_ok());
    }

    #[tokio::test]
    async fn test_idle_run_wakes_on_new_input() {
        let workflow = pipeline();
        let handle = start(&workflow, text("one"), RuntimeConfig::default());

        let mut stream = handle.watch_event_stream(false).unwrap();
        let first = collect_outputs(&mut stream).await;
        assert_eq!(first.last().unwrap(), "ENO");
        drop(stream);

        handle.send_input(text("two")).await;
        let mut stream = handle.watch_event_stream(false).unwrap();
        let second = collect_outputs(&mut stream).await;
        assert_eq!(second.last().unwrap(), "OWT");
    }

    #[tokio::test]
    async fn test_halt_is_intercepted_not_surfaced() {
        let workflow = pipeline();
        let handle = start(&workflow, text("x"), RuntimeConfig::default());
        handle.request_halt().await;

        let mut stream = handle.watch_event_stream(false).unwrap();
        while let Some(event) = stream.next().await {
            assert!(!event.unwrap().is_halt());
        }
        assert_eq!(handle.status().await, RunStatus::Ended);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let workflow = pipeline();
        let handle = start(&workflow, text("x"), RuntimeConfig::default());
        handle.cancel();

        let mut stream = handle.watch_event_stream(true).unwrap();
        // Stream ends without executing anything.
        while let Some(event) = stream.next().await {
            event.unwrap();
        }
        assert_eq!(handle.status().await, RunStatus::Cancelled);

        handle.send_input(text("too late")).await;
        assert_eq!(handle.status().await, RunStatus::Cancelled);
    }

    fn approval_workflow() -> strand_graph::Workflow {
        let port = RequestPort::new("approval", "approval.request", "approval.response");
        let ask_port = port.clone();
        let asker: Arc<dyn Executor> = Arc::new(FnExecutor::new(
            "asker",
            RouteTable::new().route("text").route("approval.response"),
            move |envelope, ctx| {
                let port = ask_port.clone();
                Box::pin(async move {
                    if envelope.message.is("approval.response") {
                        let verdict: String = envelope.message.materialize()?;
                        return Ok(Some(PortableValue::from_typed("text", &verdict)?));
                    }
                    ctx.post_request(
                        port,
                        PortableValue::from_typed("approval.request", &"may I?".to_string())?,
                    );
                    Ok(None)
                })
            },
        ));
        WorkflowBuilder::new("asker")
            .add_executor(asker)
            .add_port(port, "asker")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_pending_request_suspends_and_resumes() {
        let workflow = approval_workflow();
        let handle = start(&workflow, text("go"), RuntimeConfig::default());

        let mut stream = handle.watch_event_stream(false).unwrap();
        let mut posted = None;
        while let Some(event) = stream.next().await {
            if let RunEvent::RequestPosted { request } = event.unwrap() {
                posted = Some(request);
            }
        }
        let request = posted.expect("request surfaced before the stream rested");
        assert_eq!(handle.status().await, RunStatus::PendingRequests);
        drop(stream);

        handle
            .send_response(&ExternalResponse::to(
                &request,
                PortableValue::from_typed("approval.response", &"approved".to_string()).unwrap(),
            ))
            .await
            .unwrap();

        let mut stream = handle.watch_event_stream(false).unwrap();
        let outputs = collect_outputs(&mut stream).await;
        assert_eq!(outputs, vec!["approved".to_string()]);
        assert_eq!(handle.status().await, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_blocking_stream_waits_for_response() {
        let workflow = approval_workflow();
        let handle = start(&workflow, text("go"), RuntimeConfig::default());
        let responder = handle.clone();

        let driver = tokio::spawn(async move {
            let mut stream = handle.watch_event_stream(true).unwrap();
            let mut outputs = Vec::new();
            while let Some(event) = stream.next().await {
                match event.unwrap() {
                    RunEvent::RequestPosted { request } => {
                        let response = ExternalResponse::to(
                            &request,
                            PortableValue::from_typed(
                                "approval.response",
                                &"approved".to_string(),
                            )
                            .unwrap(),
                        );
                        responder.send_response(&response).await.unwrap();
                    }
                    RunEvent::ExecutorCompleted {
                        result: Some(value),
                        ..
                    } => outputs.push(value.materialize::<String>().unwrap()),
                    _ => {}
                }
            }
            outputs
        });

        let outputs = driver.await.unwrap();
        assert_eq!(outputs, vec!["approved".to_string()]);
    }

    #[tokio::test]
    async fn test_export_requires_drained_stream() {
        let workflow = pipeline();
        let handle = start(&workflow, text("x"), RuntimeConfig::default());

        let mut stream = handle.watch_event_stream(false).unwrap();
        // Consume one event, leaving more behind.
        stream.next().await.unwrap().unwrap();
        let err = handle.export_checkpoint().await.unwrap_err();
        assert!(matches!(err, StrandError::CheckpointPrecondition(_)));

        while stream.next().await.is_some() {}
        handle.export_checkpoint().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_rejects_unknown_version() {
        let workflow = pipeline();
        let handle = start(&workflow, text("x"), RuntimeConfig::default());
        let mut stream = handle.watch_event_stream(false).unwrap();
        while stream.next().await.is_some() {}

        let mut snapshot = handle.export_checkpoint().await.unwrap();
        snapshot.version = 99;
        let err = resume(&workflow, snapshot, RuntimeConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_resume_republishes_requests() {
        let workflow = approval_workflow();
        let handle = start(&workflow, text("go"), RuntimeConfig::default());

        let mut stream = handle.watch_event_stream(false).unwrap();
        while stream.next().await.is_some() {}
        drop(stream);
        let snapshot = handle.export_checkpoint().await.unwrap();
        assert_eq!(snapshot.outstanding.len(), 1);

        // A brand-new graph instance picks the run back up.
        let restored = resume(&approval_workflow(), snapshot, RuntimeConfig::default())
            .await
            .unwrap();
        assert_eq!(restored.status().await, RunStatus::PendingRequests);

        let mut stream = restored.watch_event_stream(false).unwrap();
        let mut republished = None;
        while let Some(event) = stream.next().await {
            if let RunEvent::RequestPosted { request } = event.unwrap() {
                republished = Some(request);
            }
        }
        let request = republished.expect("outstanding request republished on restore");
        drop(stream);

        restored
            .send_response(&ExternalResponse::to(
                &request,
                PortableValue::from_typed("approval.response", &"approved".to_string()).unwrap(),
            ))
            .await
            .unwrap();
        let mut stream = restored.watch_event_stream(false).unwrap();
        let outputs = collect_outputs(&mut stream).await;
        assert_eq!(outputs, vec!["approved".to_string()]);
    }

    #[tokio::test]
    async fn test_checkpoint_preserves_executor_state() {
        let counter: Arc<dyn Executor> = Arc::new(FnExecutor::new(
            "counter",
            RouteTable::new().route("text"),
            |_envelope, ctx| {
                Box::pin(async move {
                    let seen: u64 = match ctx.read_state("seen", None)? {
                        Some(value) => value.materialize()?,
                        None => 0,
                    };
                    ctx.queue_state_update(
                        "seen",
                        None,
                        Some(PortableValue::from_typed("count", &(seen + 1))?),
                    )?;
                    Ok(Some(PortableValue::from_typed("count", &(seen + 1))?))
                })
            },
        ));
        let build = |counter: Arc<dyn Executor>| {
            WorkflowBuilder::new("counter")
                .add_executor(counter)
                .build()
                .unwrap()
        };

        let workflow = build(counter.clone());
        let handle = start(&workflow, text("one"), RuntimeConfig::default());
        let mut stream = handle.watch_event_stream(false).unwrap();
        while stream.next().await.is_some() {}
        drop(stream);
        let snapshot = handle.export_checkpoint().await.unwrap();

        let restored = resume(&build(counter), snapshot, RuntimeConfig::default())
            .await
            .unwrap();
        restored.send_input(text("two")).await;
        let mut stream = restored.watch_event_stream(false).unwrap();
        let mut last = 0u64;
        while let Some(event) = stream.next().await {
            if let RunEvent::ExecutorCompleted {
                result: Some(value),
                ..
            } = event.unwrap()
            {
                last = value.materialize().unwrap();
            }
        }
        assert_eq!(last, 2, "state carried across the checkpoint");
    }
}
