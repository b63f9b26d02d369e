//! The run dispatcher.
//!
//! `Runner` owns admission control, the concurrency cap, per-run task
//! lifecycle, log fan-out, draining, and resume-on-startup. Each admitted
//! run executes on its own task; the run record is mutated only by that
//! task, serialising writes per run without row locks.
//!
//! # Dispatch model
//!
//! Submissions land in a priority admission queue. A single dispatcher
//! loop acquires a semaphore permit (capacity `max_parallel`) and then
//! pops the highest-priority job, so priority is honored at the moment a
//! slot frees up. Cancellation before admission releases the permit
//! without running the job.

pub mod fanout;
pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use conductor_types::checkpoint::Checkpoint;
use conductor_types::config::RunnerSettings;
use conductor_types::error::{CoreError, CoreResult, ErrorKind};
use conductor_types::event::{EventKind, EventLevel};
use conductor_types::run::{Run, RunFilter, RunSource, RunStatus, RuntimeOverrides};
use conductor_types::workflow::{ErrorStrategy, WorkflowDefinition};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{Backend, with_backoff};
use crate::executor::{BoxStepExecutor, StepOutcome, StepRequest};
use crate::parser::{self, WorkflowParser, YamlWorkflowParser};
use crate::template::{SimpleTemplateEngine, TemplateEngine};

use fanout::{LogHub, Subscription};
use queue::{AdmissionQueue, QueuedJob};

/// Default per-step timeout when neither the step nor the submission
/// overrides it.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// The workflow being submitted.
pub enum SubmittedWorkflow {
    /// Raw YAML bytes (inline submission).
    Yaml(Vec<u8>),
    /// An already-parsed definition (endpoint, schedule, webhook paths).
    Definition(WorkflowDefinition),
}

/// A run submission.
pub struct SubmitRequest {
    pub workflow: SubmittedWorkflow,
    pub source: RunSource,
    pub inputs: HashMap<String, Value>,
    pub overrides: RuntimeOverrides,
    pub priority: i32,
    pub correlation_id: Option<String>,
    pub workspace: Option<String>,
    pub profile: Option<String>,
}

impl SubmitRequest {
    /// Inline YAML submission with defaults.
    pub fn yaml(bytes: Vec<u8>) -> Self {
        Self {
            workflow: SubmittedWorkflow::Yaml(bytes),
            source: RunSource::Inline,
            inputs: HashMap::new(),
            overrides: RuntimeOverrides::default(),
            priority: 0,
            correlation_id: None,
            workspace: None,
            profile: None,
        }
    }

    /// Pre-parsed definition submission with defaults.
    pub fn definition(def: WorkflowDefinition, source: RunSource) -> Self {
        Self {
            workflow: SubmittedWorkflow::Definition(def),
            source,
            inputs: HashMap::new(),
            overrides: RuntimeOverrides::default(),
            priority: 0,
            correlation_id: None,
            workspace: None,
            profile: None,
        }
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_source(mut self, source: RunSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

enum StepResult {
    Outcome(StepOutcome),
    Cancelled,
    TimedOut,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Admission control, concurrency cap, draining, per-run task lifecycle,
/// log fan-out, and resume-on-startup.
pub struct Runner<B: Backend + 'static> {
    backend: Arc<B>,
    executor: Option<Arc<BoxStepExecutor>>,
    parser: Arc<dyn WorkflowParser>,
    templates: Arc<dyn TemplateEngine>,
    hub: Arc<LogHub>,
    queue: Arc<AdmissionQueue>,
    semaphore: Arc<Semaphore>,
    draining: AtomicBool,
    active: AtomicUsize,
    drain_notify: Notify,
    cancel_tokens: DashMap<String, CancellationToken>,
    submit_seq: AtomicU64,
}

impl<B: Backend + 'static> Runner<B> {
    /// Construct the runner and start its dispatcher task.
    pub fn start(
        backend: Arc<B>,
        executor: Option<BoxStepExecutor>,
        settings: RunnerSettings,
    ) -> Arc<Self> {
        Self::start_with(
            backend,
            executor,
            Arc::new(YamlWorkflowParser),
            Arc::new(SimpleTemplateEngine),
            settings,
        )
    }

    /// Construct with explicit parser/template capabilities.
    pub fn start_with(
        backend: Arc<B>,
        executor: Option<BoxStepExecutor>,
        parser: Arc<dyn WorkflowParser>,
        templates: Arc<dyn TemplateEngine>,
        settings: RunnerSettings,
    ) -> Arc<Self> {
        let runner = Arc::new(Self {
            backend,
            executor: executor.map(Arc::new),
            parser,
            templates,
            hub: Arc::new(LogHub::new(settings.event_buffer, settings.subscriber_buffer)),
            queue: Arc::new(AdmissionQueue::new(settings.queue_capacity)),
            semaphore: Arc::new(Semaphore::new(settings.max_parallel.max(1))),
            draining: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            drain_notify: Notify::new(),
            cancel_tokens: DashMap::new(),
            submit_seq: AtomicU64::new(0),
        });

        let dispatcher = Arc::clone(&runner);
        tokio::spawn(async move { dispatcher.dispatch_loop().await });
        runner
    }

    /// The log hub, for trigger-plane components that publish directly.
    pub fn hub(&self) -> &Arc<LogHub> {
        &self.hub
    }

    // -----------------------------------------------------------------------
    // Public contract
    // -----------------------------------------------------------------------

    /// Admit a new run. Returns the pending snapshot; execution is
    /// scheduled asynchronously.
    pub async fn submit(&self, req: SubmitRequest) -> CoreResult<Run> {
        if self.is_draining() {
            return Err(CoreError::draining("service is draining"));
        }

        let def = match req.workflow {
            SubmittedWorkflow::Yaml(bytes) => self.parser.parse(&bytes)?,
            SubmittedWorkflow::Definition(def) => {
                parser::validate(&def)?;
                def
            }
        };
        parser::check_required_inputs(&def, &req.inputs)?;
        let inputs = parser::merge_input_defaults(&def.inputs, req.inputs);

        let def_value = serde_json::to_value(&def)
            .map_err(|e| CoreError::fatal(format!("serialize definition: {e}")))?;
        let mut run = Run::new(
            Uuid::now_v7().to_string(),
            def.name.clone(),
            req.source,
            inputs,
            def_value,
            def.steps.len() as u32,
        );
        run.priority = req.priority;
        run.correlation_id = req.correlation_id;
        run.workspace = req.workspace;
        run.profile = req.profile;
        run.overrides = req.overrides;

        // Re-check after validation so nothing admitted post-drain creates
        // a record.
        if self.is_draining() {
            return Err(CoreError::draining("service is draining"));
        }
        with_backoff(|| self.backend.create_run(&run)).await?;

        self.hub.ensure_channel(&run.id, 1);
        self.cancel_tokens
            .insert(run.id.clone(), CancellationToken::new());
        self.active.fetch_add(1, Ordering::SeqCst);

        // Publish before enqueueing so the pending status precedes any
        // event from the dispatcher.
        self.publish_status(&run.id, RunStatus::Pending, None);

        let job = QueuedJob {
            run_id: run.id.clone(),
            priority: run.priority,
            seq: self.submit_seq.fetch_add(1, Ordering::SeqCst),
            start_index: 0,
            context: None,
        };
        if let Err(e) = self.queue.push(job) {
            // Roll back so a rejected submission leaves no trace.
            let _ = self.backend.delete_run(&run.id).await;
            self.hub.remove(&run.id);
            self.cancel_tokens.remove(&run.id);
            self.release_active();
            return Err(e);
        }

        tracing::info!(
            run_id = %run.id,
            workflow = run.workflow_name.as_str(),
            source = run.source.label(),
            priority = run.priority,
            "run submitted"
        );
        Ok(run)
    }

    /// Current snapshot of a run.
    pub async fn get(&self, id: &str) -> CoreResult<Run> {
        self.backend.get_run(id).await
    }

    /// List runs matching the filter.
    pub async fn list(&self, filter: &RunFilter) -> CoreResult<Vec<Run>> {
        self.backend.list_runs(filter).await
    }

    /// Signal cooperative cancellation. Succeeds once the signal is
    /// delivered; the run transitions asynchronously.
    pub async fn cancel(&self, id: &str) -> CoreResult<()> {
        let run = self.backend.get_run(id).await?;
        if run.status.is_terminal() {
            return Err(CoreError::not_cancellable(format!(
                "run '{id}' is already {}",
                run.status
            )));
        }
        if let Some(entry) = self.cancel_tokens.get(id) {
            entry.value().cancel();
            tracing::info!(run_id = id, "cancel signalled");
            return Ok(());
        }
        // No dispatcher owns this run (stale row from a previous
        // instance): transition directly.
        let mut run = run;
        self.finish(&mut run, RunStatus::Cancelled, "cancelled".to_string())
            .await;
        Ok(())
    }

    /// Subscribe to a run's event stream from the beginning of the replay
    /// window.
    pub async fn subscribe(&self, id: &str) -> CoreResult<Subscription> {
        self.subscribe_after(id, 0).await
    }

    /// Subscribe, replaying buffered events with sequence > `last_seq`.
    pub async fn subscribe_after(&self, id: &str, last_seq: u64) -> CoreResult<Subscription> {
        let run = self.backend.get_run(id).await?;
        if self.hub.subscribe_after(id, last_seq).is_none() {
            // Channel not materialised on this instance yet.
            self.hub.ensure_channel(id, run.last_event_seq + 1);
            if run.status.is_terminal() {
                self.hub.close(id);
            }
        }
        self.hub
            .subscribe_after(id, last_seq)
            .ok_or_else(|| CoreError::fatal("event channel unavailable"))
    }

    /// Stop admitting new runs. In-flight runs continue.
    pub fn start_draining(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            tracing::info!("draining started, new submissions refused");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Runs admitted but not yet terminal (queued + executing).
    pub fn active_run_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Block until no runs are active or the timeout expires.
    pub async fn wait_for_drain(&self, timeout: Duration) -> CoreResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drain_notify.notified();
            if self.active_run_count() == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoreError::timeout(format!(
                    "{} runs still active after drain timeout",
                    self.active_run_count()
                )));
            }
        }
    }

    /// Re-admit interrupted runs on startup. Returns how many were
    /// resumed. Non-terminal runs without a checkpoint are marked failed.
    pub async fn resume_interrupted(&self) -> CoreResult<usize> {
        let runs = self.backend.list_runs(&RunFilter::default()).await?;
        let mut resumed = 0usize;
        for run in runs.into_iter().filter(|r| !r.status.is_terminal()) {
            match self.backend.get_checkpoint(&run.id).await {
                Ok(cp) => {
                    self.hub.ensure_channel(&run.id, run.last_event_seq + 1);
                    self.cancel_tokens
                        .insert(run.id.clone(), CancellationToken::new());
                    self.active.fetch_add(1, Ordering::SeqCst);
                    let job = QueuedJob {
                        run_id: run.id.clone(),
                        priority: run.priority,
                        seq: self.submit_seq.fetch_add(1, Ordering::SeqCst),
                        start_index: cp.step_index,
                        context: Some(cp.context),
                    };
                    if let Err(e) = self.queue.push(job) {
                        self.cancel_tokens.remove(&run.id);
                        self.release_active();
                        tracing::warn!(run_id = %run.id, error = %e, "could not re-admit run");
                        continue;
                    }
                    tracing::info!(
                        run_id = %run.id,
                        step_index = cp.step_index,
                        "resuming interrupted run"
                    );
                    resumed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let mut run = run;
                    self.hub.ensure_channel(&run.id, run.last_event_seq + 1);
                    // finish() releases a slot; take one so the counter
                    // balances for a run this instance never admitted.
                    self.active.fetch_add(1, Ordering::SeqCst);
                    self.finish(
                        &mut run,
                        RunStatus::Failed,
                        "interrupted without checkpoint".to_string(),
                    )
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resumed)
    }

    /// Wait until a run reaches a terminal state, or `Timeout`.
    pub async fn wait_terminal(&self, id: &str, timeout: Duration) -> CoreResult<Run> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut sub = self.subscribe_after(id, self.hub.current_seq(id)).await?;
        loop {
            let run = self.backend.get_run(id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            match tokio::time::timeout_at(deadline, sub.recv()).await {
                Err(_) => {
                    return Err(CoreError::timeout(format!(
                        "run '{id}' not terminal before deadline"
                    )));
                }
                Ok(None) => return self.backend.get_run(id).await,
                Ok(Some(_)) => continue,
            }
        }
    }

    /// Close the admission queue; the dispatcher exits once drained.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(job) = self.queue.pop().await else {
                break;
            };

            let token = self
                .cancel_tokens
                .get(&job.run_id)
                .map(|entry| entry.value().clone())
                .unwrap_or_default();

            if token.is_cancelled() {
                // Cancelled before admission: no semaphore slot consumed.
                drop(permit);
                let runner = Arc::clone(&self);
                tokio::spawn(async move {
                    runner
                        .finish_by_id(&job.run_id, "cancelled before admission")
                        .await;
                });
                continue;
            }

            let runner = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                runner.run_job(job, token).await;
            });
        }
        tracing::debug!("dispatcher stopped");
    }

    async fn run_job(&self, job: QueuedJob, token: CancellationToken) {
        let mut run = match with_backoff(|| self.backend.get_run(&job.run_id)).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(run_id = %job.run_id, error = %e, "dropping job, run row unreadable");
                self.cancel_tokens.remove(&job.run_id);
                self.release_active();
                return;
            }
        };
        if run.status.is_terminal() {
            self.cancel_tokens.remove(&run.id);
            self.release_active();
            return;
        }
        if token.is_cancelled() {
            self.finish(&mut run, RunStatus::Cancelled, "cancelled".to_string())
                .await;
            return;
        }

        let def: WorkflowDefinition = match serde_json::from_value(run.definition.clone()) {
            Ok(def) => def,
            Err(e) => {
                self.finish(
                    &mut run,
                    RunStatus::Failed,
                    format!("corrupt stored definition: {e}"),
                )
                .await;
                return;
            }
        };

        run.status = RunStatus::Running;
        run.started_at.get_or_insert_with(Utc::now);
        if self.persist(&run).await.is_err() {
            self.finish(
                &mut run,
                RunStatus::Failed,
                "storage failure at run start".to_string(),
            )
            .await;
            return;
        }
        self.publish_status(&run.id, RunStatus::Running, None);

        let mut ctx = job.context.clone().unwrap_or_else(|| {
            json!({
                "steps": {},
                "inputs": run.inputs.clone(),
                "trigger": run.inputs.get("payload").cloned().unwrap_or(Value::Null),
            })
        });

        let mut index = job.start_index as usize;
        while index < def.steps.len() {
            if token.is_cancelled() {
                self.finish(&mut run, RunStatus::Cancelled, "cancelled".to_string())
                    .await;
                return;
            }
            let step = def.steps[index].clone();
            run.current_step_id = step.id.clone();

            // Checkpoint before invoking the executor.
            let cp = Checkpoint::new(run.id.clone(), step.id.clone(), index as u32, ctx.clone());
            if with_backoff(|| self.backend.save_checkpoint(&cp)).await.is_err() {
                self.finish(
                    &mut run,
                    RunStatus::Failed,
                    format!("checkpoint write failed at step '{}'", step.id),
                )
                .await;
                return;
            }
            self.hub.publish(
                &run.id,
                EventLevel::Info,
                EventKind::StepStart,
                json!({
                    "step_id": step.id,
                    "step_index": index,
                    "step_type": step.config.type_str(),
                }),
            );
            run.last_event_seq = self.hub.current_seq(&run.id);
            if self.persist(&run).await.is_err() {
                self.finish(
                    &mut run,
                    RunStatus::Failed,
                    format!("storage failure before step '{}'", step.id),
                )
                .await;
                return;
            }

            let started = std::time::Instant::now();
            let result = self.execute_step(&run, &step, &ctx, &token).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                StepResult::Cancelled => {
                    self.finish(&mut run, RunStatus::Cancelled, "cancelled".to_string())
                        .await;
                    return;
                }
                StepResult::Outcome(StepOutcome::Ok { output, metrics }) => {
                    ctx["steps"][&step.id] = json!({"output": output});
                    let mut payload = json!({
                        "step_id": step.id,
                        "step_index": index,
                        "duration_ms": duration_ms,
                    });
                    if let Some(metrics) = metrics {
                        payload["metrics"] = serde_json::to_value(metrics).unwrap_or(Value::Null);
                    }
                    self.hub
                        .publish(&run.id, EventLevel::Info, EventKind::StepComplete, payload);
                }
                StepResult::Outcome(StepOutcome::Skipped) => {
                    self.hub.publish(
                        &run.id,
                        EventLevel::Info,
                        EventKind::StepComplete,
                        json!({
                            "step_id": step.id,
                            "step_index": index,
                            "skipped": true,
                        }),
                    );
                }
                failed => {
                    let error = match failed {
                        StepResult::TimedOut => "step timeout".to_string(),
                        StepResult::Outcome(StepOutcome::Failed { error }) => error,
                        _ => unreachable!("ok/skipped/cancelled handled above"),
                    };
                    match step.on_error {
                        ErrorStrategy::Ignore => {
                            tracing::warn!(
                                run_id = %run.id,
                                step_id = step.id.as_str(),
                                error = error.as_str(),
                                "step failed, strategy=ignore"
                            );
                            self.hub.publish(
                                &run.id,
                                EventLevel::Warn,
                                EventKind::Log,
                                json!({
                                    "step_id": step.id,
                                    "error": error,
                                    "ignored": true,
                                }),
                            );
                        }
                        ErrorStrategy::Fail => {
                            self.finish(
                                &mut run,
                                RunStatus::Failed,
                                format!("step '{}' failed: {error}", step.id),
                            )
                            .await;
                            return;
                        }
                    }
                }
            }

            run.completed_step_count += 1;
            run.last_event_seq = self.hub.current_seq(&run.id);
            if self.persist(&run).await.is_err() {
                self.finish(
                    &mut run,
                    RunStatus::Failed,
                    format!("storage failure after step '{}'", step.id),
                )
                .await;
                return;
            }
            index += 1;
        }

        // Resolve declared outputs through the template engine.
        let mut output = HashMap::new();
        for (name, template) in &def.outputs {
            let value = self
                .templates
                .resolve_value(template, &ctx)
                .unwrap_or(Value::Null);
            output.insert(name.clone(), value);
        }
        if !output.is_empty() {
            self.hub.publish(
                &run.id,
                EventLevel::Info,
                EventKind::Output,
                serde_json::to_value(&output).unwrap_or(Value::Null),
            );
        }
        run.output = output;
        run.current_step_id.clear();
        self.finish(&mut run, RunStatus::Completed, String::new()).await;
    }

    async fn execute_step(
        &self,
        run: &Run,
        step: &conductor_types::workflow::StepDefinition,
        ctx: &Value,
        token: &CancellationToken,
    ) -> StepResult {
        let timeout = Duration::from_secs(
            run.overrides
                .timeout_secs
                .or(step.timeout_secs)
                .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS),
        );

        let Some(executor) = &self.executor else {
            // Nil executor (tests): every step completes with null output.
            return StepResult::Outcome(StepOutcome::Ok {
                output: Value::Null,
                metrics: None,
            });
        };

        let request = StepRequest {
            run_id: run.id.clone(),
            step: step.clone(),
            context: ctx.clone(),
            overrides: run.overrides.clone(),
        };
        let executor = Arc::clone(executor);
        // Spawned so executor panics abort the step, not the dispatcher.
        let mut handle = tokio::spawn(async move { executor.execute(request).await });

        tokio::select! {
            _ = token.cancelled() => {
                handle.abort();
                StepResult::Cancelled
            }
            result = tokio::time::timeout(timeout, &mut handle) => match result {
                Err(_) => {
                    handle.abort();
                    StepResult::TimedOut
                }
                Ok(Ok(outcome)) => StepResult::Outcome(outcome),
                Ok(Err(join_err)) => {
                    if join_err.is_panic() {
                        tracing::error!(
                            run_id = %run.id,
                            step_id = step.id.as_str(),
                            "step executor panicked"
                        );
                        StepResult::Outcome(StepOutcome::Failed {
                            error: "step executor panicked".to_string(),
                        })
                    } else {
                        StepResult::Cancelled
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn finish_by_id(&self, run_id: &str, error: &str) {
        match with_backoff(|| self.backend.get_run(run_id)).await {
            Ok(mut run) if !run.status.is_terminal() => {
                self.finish(&mut run, RunStatus::Cancelled, error.to_string())
                    .await;
            }
            Ok(_) => {
                self.cancel_tokens.remove(run_id);
                self.release_active();
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "could not load run for cancellation");
                self.cancel_tokens.remove(run_id);
                self.release_active();
            }
        }
    }

    /// Write the terminal status, remove the checkpoint, close the event
    /// channel, and release the run's slot.
    async fn finish(&self, run: &mut Run, status: RunStatus, error: String) {
        run.status = status;
        run.error = error;
        run.completed_at = Some(Utc::now());

        self.publish_status(&run.id, status, (!run.error.is_empty()).then_some(&run.error));
        run.last_event_seq = self.hub.current_seq(&run.id);

        if let Err(e) = with_backoff(|| self.backend.update_run(run)).await {
            tracing::error!(run_id = %run.id, error = %e, "terminal status write failed");
        }
        if let Err(e) = with_backoff(|| self.backend.delete_checkpoint(&run.id)).await {
            tracing::warn!(run_id = %run.id, error = %e, "checkpoint removal failed");
        }

        tracing::info!(
            run_id = %run.id,
            workflow = run.workflow_name.as_str(),
            status = %status,
            steps = run.completed_step_count,
            "run finished"
        );

        self.hub.close(&run.id);
        self.cancel_tokens.remove(&run.id);
        self.release_active();
    }

    fn release_active(&self) {
        // Saturating: finish paths for runs this instance never admitted
        // must not underflow.
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.drain_notify.notify_waiters();
    }

    fn publish_status(&self, run_id: &str, status: RunStatus, error: Option<&String>) {
        let level = match status {
            RunStatus::Failed => EventLevel::Error,
            RunStatus::Cancelled => EventLevel::Warn,
            _ => EventLevel::Info,
        };
        let mut payload = json!({"status": status.as_str()});
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        self.hub.publish(run_id, level, EventKind::Status, payload);
    }

    async fn persist(&self, run: &Run) -> CoreResult<()> {
        with_backoff(|| self.backend.update_run(run)).await.map_err(|e| {
            tracing::error!(run_id = %run.id, error = %e, "run update failed");
            e
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::CheckpointStore;
    use crate::backend::RunStore;
    use crate::executor::LocalStepExecutor;
    use conductor_types::error::ErrorKind;

    fn settings() -> RunnerSettings {
        RunnerSettings::default()
    }

    fn noop_runner() -> (Arc<MemoryBackend>, Arc<Runner<MemoryBackend>>) {
        let backend = Arc::new(MemoryBackend::new());
        let runner = Runner::start(Arc::clone(&backend), None, settings());
        (backend, runner)
    }

    fn local_runner() -> (Arc<MemoryBackend>, Arc<Runner<MemoryBackend>>) {
        let backend = Arc::new(MemoryBackend::new());
        let executor = BoxStepExecutor::new(LocalStepExecutor::new(std::env::temp_dir()));
        let runner = Runner::start(Arc::clone(&backend), Some(executor), settings());
        (backend, runner)
    }

    const TWO_NOOPS: &str = "name: t\nsteps:\n  - id: a\n    type: noop\n  - id: b\n    type: noop\n";

    #[tokio::test]
    async fn test_submit_two_step_workflow_completes() {
        let (backend, runner) = noop_runner();
        let run = runner
            .submit(SubmitRequest::yaml(TWO_NOOPS.as_bytes().to_vec()))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        let mut sub = runner.subscribe(&run.id).await.unwrap();
        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.completed_step_count, 2);
        assert_eq!(done.total_step_count, 2);

        // Subscriber observed both step completions and the terminal status.
        let mut step_completes = Vec::new();
        let mut saw_completed = false;
        while let Some(event) = sub.recv().await {
            match event.kind {
                EventKind::StepComplete => {
                    step_completes.push(event.payload["step_id"].as_str().unwrap().to_string());
                }
                EventKind::Status if event.payload["status"] == "completed" => {
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert_eq!(step_completes, vec!["a", "b"]);
        assert!(saw_completed);

        // Checkpoint removed on terminal completion.
        assert_eq!(
            backend.get_checkpoint(&run.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_zero_step_workflow_completes_with_empty_output() {
        let (_backend, runner) = noop_runner();
        let run = runner
            .submit(SubmitRequest::yaml(b"name: empty\n".to_vec()))
            .await
            .unwrap();
        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.output.is_empty());
        assert_eq!(done.completed_step_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run() {
        let (backend, runner) = local_runner();
        let yaml = b"name: slow\nsteps:\n  - id: nap\n    type: wait\n    seconds: 5\n".to_vec();
        let run = runner.submit(SubmitRequest::yaml(yaml)).await.unwrap();

        // Give the dispatcher a moment to admit the run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.cancel(&run.id).await.unwrap();

        let done = runner
            .wait_terminal(&run.id, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
        assert!(!done.error.is_empty());
        assert_eq!(
            backend.get_checkpoint(&run.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_cancel_terminal_run_is_not_cancellable() {
        let (_backend, runner) = noop_runner();
        let run = runner
            .submit(SubmitRequest::yaml(TWO_NOOPS.as_bytes().to_vec()))
            .await
            .unwrap();
        runner
            .wait_terminal(&run.id, Duration::from_secs(2))
            .await
            .unwrap();
        let err = runner.cancel(&run.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotCancellable);
    }

    #[tokio::test]
    async fn test_submit_after_draining_creates_no_record() {
        let (backend, runner) = noop_runner();
        runner.start_draining();
        assert!(runner.is_draining());

        let err = runner
            .submit(SubmitRequest::yaml(TWO_NOOPS.as_bytes().to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Draining);
        assert!(backend
            .list_runs(&RunFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_malformed_yaml_never_becomes_a_run() {
        let (backend, runner) = noop_runner();
        let err = runner
            .submit(SubmitRequest::yaml(b"steps: [{{".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(backend
            .list_runs(&RunFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_capacity_exhausted_rolls_back_record() {
        let backend = Arc::new(MemoryBackend::new());
        let runner = Runner::start(
            Arc::clone(&backend),
            None,
            RunnerSettings {
                queue_capacity: Some(0),
                ..Default::default()
            },
        );
        let err = runner
            .submit(SubmitRequest::yaml(TWO_NOOPS.as_bytes().to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
        assert!(backend
            .list_runs(&RunFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(runner.active_run_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_step_with_fail_strategy_fails_run() {
        let (_backend, runner) = local_runner();
        let yaml = b"name: f\nsteps:\n  - id: boom\n    type: shell\n    command: \"exit 7\"\n"
            .to_vec();
        let run = runner.submit(SubmitRequest::yaml(yaml)).await.unwrap();
        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.contains("boom"));
    }

    #[tokio::test]
    async fn test_failed_step_with_ignore_strategy_advances() {
        let (_backend, runner) = local_runner();
        let yaml = b"name: f\nsteps:\n  - id: boom\n    type: shell\n    command: \"exit 7\"\n    on_error: ignore\n  - id: after\n    type: noop\n"
            .to_vec();
        let run = runner.submit(SubmitRequest::yaml(yaml)).await.unwrap();
        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.completed_step_count, 2);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_run() {
        let (_backend, runner) = local_runner();
        let yaml =
            b"name: t\nsteps:\n  - id: nap\n    type: wait\n    seconds: 30\n    timeout_secs: 0\n"
                .to_vec();
        let run = runner.submit(SubmitRequest::yaml(yaml)).await.unwrap();
        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.contains("step timeout"));
    }

    #[tokio::test]
    async fn test_outputs_resolved_from_context() {
        let (_backend, runner) = local_runner();
        let yaml = b"name: o\nsteps:\n  - id: say\n    type: shell\n    command: \"echo hi\"\noutputs:\n  said: \"{{ steps.say.output.stdout }}\"\n"
            .to_vec();
        let run = runner.submit(SubmitRequest::yaml(yaml)).await.unwrap();
        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output["said"], json!("hi"));
    }

    #[tokio::test]
    async fn test_wait_for_drain_completes_when_idle() {
        let (_backend, runner) = noop_runner();
        let run = runner
            .submit(SubmitRequest::yaml(TWO_NOOPS.as_bytes().to_vec()))
            .await
            .unwrap();
        runner.start_draining();
        runner
            .wait_for_drain(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(runner.active_run_count(), 0);
        let done = runner.get(&run.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_for_drain_times_out_with_active_run() {
        let (_backend, runner) = local_runner();
        let yaml = b"name: slow\nsteps:\n  - id: nap\n    type: wait\n    seconds: 10\n".to_vec();
        let run = runner.submit(SubmitRequest::yaml(yaml)).await.unwrap();
        runner.start_draining();
        let err = runner
            .wait_for_drain(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        runner.cancel(&run.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_interrupted_continues_from_checkpoint() {
        // Simulate a crashed instance: run row in Running with a
        // checkpoint at step index 1.
        let backend = Arc::new(MemoryBackend::new());
        let def: WorkflowDefinition = serde_yaml_ng::from_str(
            "name: t\nsteps:\n  - id: a\n    type: noop\n  - id: b\n    type: noop\n  - id: c\n    type: noop\n",
        )
        .unwrap();
        let mut run = Run::new(
            Uuid::now_v7().to_string(),
            def.name.clone(),
            RunSource::Inline,
            HashMap::new(),
            serde_json::to_value(&def).unwrap(),
            3,
        );
        run.status = RunStatus::Running;
        run.completed_step_count = 1;
        run.last_event_seq = 4;
        backend.create_run(&run).await.unwrap();
        backend
            .save_checkpoint(&Checkpoint::new(
                run.id.clone(),
                "b".to_string(),
                1,
                json!({"steps": {"a": {"output": null}}, "inputs": {}, "trigger": null}),
            ))
            .await
            .unwrap();

        let runner = Runner::start(Arc::clone(&backend), None, settings());
        let resumed = runner.resume_interrupted().await.unwrap();
        assert_eq!(resumed, 1);

        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        // Steps b and c execute on the resumed instance.
        assert_eq!(done.completed_step_count, 3);
        // Event sequence continues past the persisted watermark.
        assert!(done.last_event_seq > 4);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_marks_failed() {
        let backend = Arc::new(MemoryBackend::new());
        let mut run = Run::new(
            Uuid::now_v7().to_string(),
            "t".to_string(),
            RunSource::Inline,
            HashMap::new(),
            json!({"name": "t", "steps": []}),
            0,
        );
        run.status = RunStatus::Running;
        backend.create_run(&run).await.unwrap();

        let runner = Runner::start(Arc::clone(&backend), None, settings());
        let resumed = runner.resume_interrupted().await.unwrap();
        assert_eq!(resumed, 0);

        let failed = backend.get_run(&run.id).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error, "interrupted without checkpoint");
    }

    struct SkipLastExecutor;

    impl crate::executor::StepExecutor for SkipLastExecutor {
        async fn execute(&self, req: StepRequest) -> StepOutcome {
            if req.step.id == "last" {
                StepOutcome::Skipped
            } else {
                StepOutcome::Ok {
                    output: json!("ran"),
                    metrics: None,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_skipped_last_step_still_completes() {
        let backend = Arc::new(MemoryBackend::new());
        let runner = Runner::start(
            Arc::clone(&backend),
            Some(BoxStepExecutor::new(SkipLastExecutor)),
            settings(),
        );
        let yaml =
            b"name: t\nsteps:\n  - id: a\n    type: noop\n  - id: last\n    type: noop\noutputs:\n  from_skipped: \"{{ steps.last.output }}\"\n"
                .to_vec();
        let run = runner.submit(SubmitRequest::yaml(yaml)).await.unwrap();

        let mut sub = runner.subscribe(&run.id).await.unwrap();
        let done = runner
            .wait_terminal(&run.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        // Output depending on the skipped step resolves to null.
        assert_eq!(done.output["from_skipped"], Value::Null);

        let mut saw_skipped = false;
        while let Some(event) = sub.recv().await {
            if event.kind == EventKind::StepComplete && event.payload["skipped"] == json!(true) {
                saw_skipped = true;
            }
        }
        assert!(saw_skipped);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_run_is_not_found() {
        let (_backend, runner) = noop_runner();
        let err = runner.subscribe("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_event_sequences_are_gapless_from_start() {
        let (_backend, runner) = noop_runner();
        let run = runner
            .submit(SubmitRequest::yaml(TWO_NOOPS.as_bytes().to_vec()))
            .await
            .unwrap();
        let mut sub = runner.subscribe(&run.id).await.unwrap();
        runner
            .wait_terminal(&run.id, Duration::from_secs(2))
            .await
            .unwrap();

        let mut expected = 1u64;
        while let Some(event) = sub.recv().await {
            assert_eq!(event.sequence, expected);
            expected += 1;
        }
        assert!(expected > 1);
    }
}
