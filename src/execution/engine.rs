//! Main execution engine - orchestrates workflow runs
//!
//! Every run is owned by a single driver task. Attempt results, retry
//! timers, review decisions and cancellation all reach the driver as
//! messages, so a run is only ever mutated from one place. Callers read
//! cloned snapshots.

use crate::{
    core::{
        config::EngineConfig, AbortCause, Capability, EngineError, ErrorKind, Payload,
        ReviewDecision, Run, RunStatus, SkipReason, StepContext, StepDefinition, StepError,
        StepFailure, StepState, WorkflowDefinition,
    },
    events::{EventKind, EventLog, EventPublisher, Subscription},
    execution::{
        executor::EventTokenSink, Decision, DefaultRecoveryPolicy, ExecutionScheduler,
        RecoveryPolicy, SchedulingStrategy, StepExecutor,
    },
    generation::GenerationService,
    persistence::{InMemoryRunStore, RunStore},
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Messages handled by a run's driver
enum Control {
    /// A step's retry delay elapsed
    RetryDue { step_id: String },
    Approve {
        approved: bool,
        annotations: Payload,
        reply: oneshot::Sender<RunStatus>,
    },
    Cancel { reply: oneshot::Sender<RunStatus> },
    /// The review gate's deadline elapsed
    GateTimeout { step_id: String, attempt: u32 },
}

/// Result of one spawned attempt
struct AttemptOutcome {
    step_id: String,
    attempt: u32,
    result: Result<Payload, StepError>,
}

/// Engine-side handle of a live run
struct RunHandle {
    run: Arc<Mutex<Run>>,
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<RunStatus>,
}

fn lock_run(run: &Mutex<Run>) -> MutexGuard<'_, Run> {
    run.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Main workflow execution engine
pub struct ExecutionEngine<G> {
    executor: Arc<StepExecutor<G>>,
    store: Arc<dyn RunStore>,
    publisher: Arc<EventPublisher>,
    policy: Arc<dyn RecoveryPolicy>,
    strategy: SchedulingStrategy,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
}

impl<G: GenerationService + 'static> ExecutionEngine<G> {
    /// Engine with an in-memory store and default settings
    pub fn new(generator: G) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(generator)),
            store: Arc::new(InMemoryRunStore::new()),
            publisher: Arc::new(EventPublisher::default()),
            policy: Arc::new(DefaultRecoveryPolicy::default()),
            strategy: SchedulingStrategy::default(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Apply engine settings (event capacity, backoff, concurrency)
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.publisher = Arc::new(EventPublisher::new(config.event_capacity));
        self.policy = Arc::new(DefaultRecoveryPolicy::new(config.recovery.clone()));
        self.strategy = SchedulingStrategy::from_limit(config.max_concurrent_steps);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a run, persist it and start driving it
    pub async fn submit(
        &self,
        workflow: impl Into<Arc<WorkflowDefinition>>,
        inputs: Payload,
    ) -> Result<Uuid, EngineError> {
        let workflow = workflow.into();
        let run = Run::new(&workflow, inputs);
        let run_id = run.run_id;

        for key in &workflow.initial_inputs {
            if !run.inputs.contains_key(key) {
                warn!(%run_id, input = %key, "Declared initial input was not supplied");
            }
        }

        self.store.save_run(&run).await?;

        let log = self.publisher.open(run_id);
        let shared = Arc::new(Mutex::new(run));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::Pending);

        let driver = RunDriver {
            run_id,
            workflow: Arc::clone(&workflow),
            run: Arc::clone(&shared),
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
            scheduler: ExecutionScheduler::new(self.strategy),
            log,
            control_tx: control_tx.downgrade(),
            control_rx,
            control_open: true,
            status_tx,
            cancel: CancellationToken::new(),
            attempts: JoinSet::new(),
            in_flight: HashMap::new(),
            backing_off: HashSet::new(),
            unrecovered: None,
            finalized: false,
        };

        self.runs().insert(
            run_id,
            RunHandle {
                run: shared,
                control: control_tx,
                status: status_rx,
            },
        );

        info!(%run_id, workflow = %workflow.name, "Submitted run");
        tokio::spawn(driver.drive());

        Ok(run_id)
    }

    /// Record the reviewer's decision for a run halted at its gate
    ///
    /// A run that is not awaiting review is left untouched and its current
    /// status returned.
    pub async fn approve(
        &self,
        run_id: Uuid,
        approved: bool,
        annotations: Payload,
    ) -> Result<RunStatus, EngineError> {
        let control = self.control(run_id).await?;
        if let Some(control) = control {
            let (reply, answer) = oneshot::channel();
            let sent = control.send(Control::Approve {
                approved,
                annotations,
                reply,
            });
            if sent.is_ok() {
                if let Ok(status) = answer.await {
                    return Ok(status);
                }
            }
        }
        self.settled_status(run_id).await
    }

    /// Cooperatively cancel a run
    ///
    /// Returns `Aborted` for a live run; a terminal run keeps its status.
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let control = self.control(run_id).await?;
        if let Some(control) = control {
            let (reply, answer) = oneshot::channel();
            if control.send(Control::Cancel { reply }).is_ok() {
                if let Ok(status) = answer.await {
                    return Ok(status);
                }
            }
        }
        self.settled_status(run_id).await
    }

    /// Status of a run no driver answers for
    ///
    /// Terminal runs report their final status; anything else lost its driver.
    async fn settled_status(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let run = self.snapshot(run_id).await?;
        if run.is_terminal() {
            Ok(run.status)
        } else {
            Err(EngineError::EngineClosed(run_id))
        }
    }

    /// Control channel of a live run; `None` when only the store knows it
    async fn control(
        &self,
        run_id: Uuid,
    ) -> Result<Option<mpsc::UnboundedSender<Control>>, EngineError> {
        let live = self.runs().get(&run_id).map(|h| h.control.clone());
        if live.is_some() {
            return Ok(live);
        }
        match self.store.load_run(run_id).await? {
            Some(_) => Ok(None),
            None => Err(EngineError::UnknownRun(run_id)),
        }
    }

    /// Current state of a run
    pub async fn snapshot(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let live = self
            .runs()
            .get(&run_id)
            .map(|handle| lock_run(&handle.run).clone());
        if let Some(run) = live {
            return Ok(run);
        }
        self.store
            .load_run(run_id)
            .await?
            .ok_or(EngineError::UnknownRun(run_id))
    }

    /// Subscribe to a run's events starting at `from_sequence`
    pub fn subscribe(&self, run_id: Uuid, from_sequence: u64) -> Result<Subscription, EngineError> {
        self.publisher
            .subscribe(run_id, from_sequence)
            .ok_or(EngineError::UnknownRun(run_id))
    }

    /// Wait until the run awaits review or reaches a terminal status
    pub async fn wait(&self, run_id: Uuid) -> Result<Run, EngineError> {
        self.wait_until(run_id, |status| {
            status.is_terminal() || *status == RunStatus::AwaitingReview
        })
        .await
    }

    /// Wait until the run reaches a terminal status
    pub async fn wait_for_terminal(&self, run_id: Uuid) -> Result<Run, EngineError> {
        self.wait_until(run_id, RunStatus::is_terminal).await
    }

    async fn wait_until(
        &self,
        run_id: Uuid,
        done: impl Fn(&RunStatus) -> bool,
    ) -> Result<Run, EngineError> {
        let status = self.runs().get(&run_id).map(|h| h.status.clone());
        if let Some(mut status) = status {
            if status.wait_for(|s| done(s)).await.is_err() {
                debug!(%run_id, "Run driver stopped while waiting");
            }
        }
        self.snapshot(run_id).await
    }

    /// Drop a terminal run's in-memory state and event log
    ///
    /// The persisted snapshot is kept.
    pub async fn forget(&self, run_id: Uuid) -> Result<(), EngineError> {
        let mut runs = self.runs();
        let Some(handle) = runs.get(&run_id) else {
            return Err(EngineError::UnknownRun(run_id));
        };
        if !handle.status.borrow().is_terminal() {
            return Err(EngineError::RunNotTerminal(run_id));
        }
        runs.remove(&run_id);
        drop(runs);

        self.publisher.remove(run_id);
        debug!(%run_id, "Forgot run");
        Ok(())
    }
}

/// Single writer of one run
struct RunDriver<G> {
    run_id: Uuid,
    workflow: Arc<WorkflowDefinition>,
    run: Arc<Mutex<Run>>,
    executor: Arc<StepExecutor<G>>,
    store: Arc<dyn RunStore>,
    policy: Arc<dyn RecoveryPolicy>,
    scheduler: ExecutionScheduler,
    log: Arc<EventLog>,
    /// Weak so the run notices when the engine holding it is gone
    control_tx: mpsc::WeakUnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    status_tx: watch::Sender<RunStatus>,
    cancel: CancellationToken,
    attempts: JoinSet<AttemptOutcome>,
    /// Step id -> attempt currently in flight
    in_flight: HashMap<String, u32>,
    /// Steps waiting out a retry delay
    backing_off: HashSet<String>,
    /// First failure no recovery decision absorbed
    unrecovered: Option<StepFailure>,
    finalized: bool,
}

impl<G: GenerationService + 'static> RunDriver<G> {
    fn run(&self) -> MutexGuard<'_, Run> {
        lock_run(&self.run)
    }

    fn status(&self) -> RunStatus {
        self.run().status
    }

    fn step(&self, step_id: &str) -> Option<Arc<StepDefinition>> {
        self.workflow.step(step_id).cloned()
    }

    fn publish(&self, step_id: Option<&str>, kind: EventKind, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        self.log.publish(step_id, kind, payload);
    }

    async fn persist(&self) {
        let snapshot = self.run().clone();
        if let Err(e) = self.store.save_run(&snapshot).await {
            warn!(run_id = %self.run_id, "Failed to persist run: {:#}", e);
        }
    }

    /// Publish the observable status; a terminal status only once finalized
    fn sync_status(&self) {
        let status = self.status();
        if status.is_terminal() && !self.finalized {
            return;
        }
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    async fn drive(mut self) {
        info!(run_id = %self.run_id, workflow = %self.workflow.name, "Starting run");
        self.run().set_status(RunStatus::Running);
        self.persist().await;
        self.advance().await;

        while !self.finalized {
            tokio::select! {
                Some(joined) = self.attempts.join_next(), if !self.attempts.is_empty() => {
                    match joined {
                        Ok(outcome) => self.on_attempt_finished(outcome).await,
                        Err(e) => error!(run_id = %self.run_id, "Attempt task failed: {}", e),
                    }
                }
                message = self.control_rx.recv(), if self.control_open => match message {
                    Some(message) => self.on_control(message).await,
                    None => self.orphaned().await,
                },
                else => break,
            }
            self.advance().await;
        }

        info!(run_id = %self.run_id, status = %self.status(), "Run finished");
    }

    /// Every engine handle is gone; nobody can approve or cancel any more
    async fn orphaned(&mut self) {
        self.control_open = false;
        warn!(run_id = %self.run_id, "Engine dropped while run was live, aborting");
        self.abort(AbortCause {
            message: "engine shut down".to_string(),
            ..AbortCause::cancelled()
        })
        .await;
    }

    /// Schedule what can run, then settle the run if nothing is left to wait for
    async fn advance(&mut self) {
        if self.finalized {
            return;
        }

        if self.status() == RunStatus::Aborted {
            if self.attempts.is_empty() {
                self.finalize().await;
            }
            self.sync_status();
            return;
        }

        self.schedule().await;

        let quiescent = self.attempts.is_empty() && self.backing_off.is_empty();
        let status = self.status();
        if quiescent && matches!(status, RunStatus::Running | RunStatus::Recovering) {
            match self.unrecovered.clone() {
                Some(failure) => self.abort(AbortCause::from(&failure)).await,
                None => {
                    self.run().set_status(RunStatus::Completed);
                }
            }
            self.finalize().await;
        }
        self.sync_status();
    }

    /// Scheduling pass: propagate failures, then dispatch ready steps
    async fn schedule(&mut self) {
        loop {
            let skipped = {
                let mut run = self.run();
                self.scheduler.propagate_failures(&self.workflow, &mut run)
            };
            for (step_id, root) in &skipped {
                info!(run_id = %self.run_id, step_id = %step_id, "Skipping step, upstream '{}' failed", root);
            }

            let status = self.status();
            if status == RunStatus::AwaitingReview || status.is_terminal() {
                return;
            }

            let ready = {
                let mut run = self.run();
                let ready = self
                    .scheduler
                    .ready_steps(&self.workflow, &run, &self.backing_off);
                for step_id in &ready {
                    run.set_state(step_id, StepState::Ready);
                }
                ready
            };

            let next = self.scheduler.next_steps(&ready, self.in_flight.len());
            if next.is_empty() {
                return;
            }

            for step_id in next {
                let Some(step) = self.step(&step_id) else {
                    continue;
                };
                if step.is_gate() {
                    self.open_gate(&step).await;
                    return;
                }
                self.dispatch(step).await;
            }
        }
    }

    /// Start one attempt; unresolvable inputs fail it without spawning
    async fn dispatch(&mut self, step: Arc<StepDefinition>) {
        let (attempt, resolved) = {
            let mut run = self.run();
            let attempt = run.begin_attempt(&step.id);
            let resolved = StepContext::resolve(&step, attempt, &run.inputs, &run.outputs);
            (attempt, resolved)
        };

        let ctx = match resolved {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(run_id = %self.run_id, step_id = %step.id, "Cannot start step: {}", e);
                self.on_failure(&step.id, attempt, e).await;
                return;
            }
        };

        info!(run_id = %self.run_id, step_id = %step.id, attempt, "Starting step");
        self.publish(Some(step.id.as_str()), EventKind::StepStarted, json!({ "attempt": attempt }));
        self.in_flight.insert(step.id.clone(), attempt);
        self.persist().await;

        let executor = Arc::clone(&self.executor);
        let sink = EventTokenSink::new(Arc::clone(&self.log), &step.id);
        let token = self.cancel.child_token();
        let step_id = step.id.clone();

        self.attempts.spawn(async move {
            let work = tokio::spawn(async move { executor.execute(&step, ctx, &sink, token).await });
            let result = match work.await {
                Ok(result) => result,
                Err(e) => Err(StepError::permanent(format!("step task failed: {}", e))),
            };
            AttemptOutcome {
                step_id,
                attempt,
                result,
            }
        });
    }

    /// Halt dispatch until a reviewer decides
    async fn open_gate(&mut self, step: &StepDefinition) {
        let attempt = {
            let mut run = self.run();
            let attempt = run.begin_attempt(&step.id);
            run.set_status(RunStatus::AwaitingReview);
            attempt
        };

        let prompt = match &step.capability {
            Capability::ReviewGate { prompt } => prompt.clone(),
            _ => None,
        };
        info!(run_id = %self.run_id, step_id = %step.id, "Awaiting review");
        self.publish(
            None,
            EventKind::RunAwaitingReview,
            json!({ "step": step.id, "prompt": prompt }),
        );

        if let Some(deadline) = step.timeout {
            let tx = self.control_tx.clone();
            let cancel = self.cancel.clone();
            let step_id = step.id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        if let Some(tx) = tx.upgrade() {
                            let _ = tx.send(Control::GateTimeout { step_id, attempt });
                        }
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        self.persist().await;
    }

    async fn on_control(&mut self, message: Control) {
        match message {
            Control::RetryDue { step_id } => {
                if self.backing_off.remove(&step_id) {
                    debug!(run_id = %self.run_id, step_id = %step_id, "Retry delay elapsed");
                    self.refresh_status();
                }
            }
            Control::Approve {
                approved,
                annotations,
                reply,
            } => {
                self.on_review(approved, annotations).await;
                self.advance().await;
                let _ = reply.send(self.status());
            }
            Control::Cancel { reply } => {
                if !self.status().is_terminal() {
                    info!(run_id = %self.run_id, "Cancelling run");
                    self.abort(AbortCause::cancelled()).await;
                }
                let _ = reply.send(self.status());
            }
            Control::GateTimeout { step_id, attempt } => {
                let still_waiting = self.status() == RunStatus::AwaitingReview
                    && self.run().step(&step_id).map(|r| r.attempts) == Some(attempt);
                if still_waiting {
                    let deadline = self
                        .step(&step_id)
                        .and_then(|s| s.timeout)
                        .unwrap_or_default();
                    warn!(run_id = %self.run_id, step_id = %step_id, "Review deadline elapsed");
                    self.run().set_status(RunStatus::Running);
                    self.on_failure(&step_id, attempt, StepError::timeout(deadline))
                        .await;
                }
            }
        }
    }

    async fn on_review(&mut self, approved: bool, annotations: Payload) {
        if self.status() != RunStatus::AwaitingReview {
            debug!(run_id = %self.run_id, "Ignoring review decision, run is not awaiting review");
            return;
        }
        let Some(gate) = self.workflow.gate().and_then(|id| self.step(id)) else {
            return;
        };

        let attempt = {
            let mut run = self.run();
            run.review = Some(ReviewDecision {
                step_id: gate.id.clone(),
                approved,
                annotations: annotations.clone(),
                decided_at: Utc::now(),
            });
            run.set_status(RunStatus::Running);
            run.step(&gate.id).map(|r| r.attempts).unwrap_or(1)
        };

        if approved {
            info!(run_id = %self.run_id, step_id = %gate.id, "Review approved");
            let mut outputs = Payload::new();
            if let Some(key) = gate.outputs.first() {
                outputs.insert(
                    key.clone(),
                    json!({ "approved": true, "annotations": annotations }),
                );
            }
            self.on_success(&gate, attempt, outputs).await;
        } else {
            info!(run_id = %self.run_id, step_id = %gate.id, "Review rejected");
            self.on_failure(&gate.id, attempt, StepError::permanent("rejected by reviewer"))
                .await;
        }
        self.refresh_status();
    }

    async fn on_attempt_finished(&mut self, outcome: AttemptOutcome) {
        let AttemptOutcome {
            step_id,
            attempt,
            result,
        } = outcome;
        self.in_flight.remove(&step_id);

        if self.status() == RunStatus::Aborted {
            // Late results are not committed
            let error = match result {
                Err(e) if e.kind == ErrorKind::Cancelled => e,
                _ => StepError::cancelled(),
            };
            self.record_failure(&step_id, attempt, &error, false);
            self.run().set_state(&step_id, StepState::Failed);
            self.persist().await;
            return;
        }

        let Some(step) = self.step(&step_id) else {
            return;
        };
        match result {
            Ok(outputs) => self.on_success(&step, attempt, outputs).await,
            Err(e) => self.on_failure(&step_id, attempt, e).await,
        }
    }

    /// Commit the declared outputs of a successful attempt
    async fn on_success(&mut self, step: &StepDefinition, attempt: u32, outputs: Payload) {
        if let Some(missing) = step.outputs.iter().find(|key| !outputs.contains_key(*key)) {
            let error = StepError::permanent(format!("step did not produce output '{}'", missing));
            self.on_failure(&step.id, attempt, error).await;
            return;
        }

        {
            let mut run = self.run();
            for key in &step.outputs {
                if let Some(value) = outputs.get(key) {
                    run.outputs.insert(key.clone(), value.clone());
                }
            }
            run.set_state(&step.id, StepState::Succeeded);
        }

        info!(run_id = %self.run_id, step_id = %step.id, attempt, "Step completed");
        self.publish(
            Some(step.id.as_str()),
            EventKind::StepCompleted,
            json!({ "attempt": attempt, "outputs": step.outputs }),
        );
        self.persist().await;
    }

    fn record_failure(&self, step_id: &str, attempt: u32, error: &StepError, will_retry: bool) {
        self.run()
            .record_failure(StepFailure::new(step_id, attempt, error));
        self.publish(
            Some(step_id),
            EventKind::StepFailed,
            json!({
                "attempt": attempt,
                "kind": error.kind.as_str(),
                "message": error.message,
                "will_retry": will_retry,
            }),
        );
    }

    /// Consult the recovery policy and apply its decision
    async fn on_failure(&mut self, step_id: &str, attempt: u32, error: StepError) {
        let Some(step) = self.step(step_id) else {
            return;
        };

        let decision = {
            let run = self.run();
            let history: Vec<StepFailure> = run.failures_of(step_id).cloned().collect();
            self.policy.decide(&step, attempt, &error, &history)
        };
        let will_retry = matches!(decision, Decision::Retry(_));
        warn!(
            run_id = %self.run_id,
            step_id = %step_id,
            attempt,
            kind = %error.kind,
            will_retry,
            "Step failed: {}",
            error.message
        );
        self.record_failure(step_id, attempt, &error, will_retry);

        match decision {
            Decision::Retry(delay) => self.schedule_retry(step_id, attempt, delay, error.kind),
            Decision::Skip => {
                info!(run_id = %self.run_id, step_id = %step_id, "Dropping non-critical branch");
                self.run().set_state(
                    step_id,
                    StepState::Skipped {
                        reason: SkipReason::BranchDropped,
                    },
                );
            }
            Decision::Abort => {
                let failure = StepFailure::new(step_id, attempt, &error);
                self.run().set_state(step_id, StepState::Failed);
                if self.unrecovered.is_none() {
                    self.unrecovered = Some(failure.clone());
                }
                if step.critical {
                    error!(run_id = %self.run_id, step_id = %step_id, "Critical step failed, aborting run");
                    self.abort(AbortCause::from(&failure)).await;
                }
            }
        }

        self.persist().await;
    }

    fn schedule_retry(&mut self, step_id: &str, attempt: u32, delay: Duration, kind: ErrorKind) {
        self.run().set_state(step_id, StepState::Pending);
        self.backing_off.insert(step_id.to_string());
        self.refresh_status();

        info!(
            run_id = %self.run_id,
            step_id = %step_id,
            attempt,
            "Retrying in {}ms",
            delay.as_millis()
        );
        self.publish(
            Some(step_id),
            EventKind::RunRecovering,
            json!({
                "step": step_id,
                "attempt": attempt,
                "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "kind": kind.as_str(),
            }),
        );

        let tx = self.control_tx.clone();
        let cancel = self.cancel.clone();
        let step_id = step_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(Control::RetryDue { step_id });
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Running or Recovering, depending on pending retries
    fn refresh_status(&self) {
        let mut run = self.run();
        if matches!(run.status, RunStatus::Running | RunStatus::Recovering) {
            let status = if self.backing_off.is_empty() {
                RunStatus::Running
            } else {
                RunStatus::Recovering
            };
            if run.status != status {
                run.set_status(status);
            }
        }
    }

    /// Stop the run: cancel in-flight attempts and skip everything not started
    async fn abort(&mut self, cause: AbortCause) {
        if self.status().is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.backing_off.clear();

        {
            let mut run = self.run();
            run.cause = Some(cause);
            run.set_status(RunStatus::Aborted);

            let idle: Vec<String> = run
                .steps
                .iter()
                .filter(|(id, record)| match record.state {
                    StepState::Pending | StepState::Ready => true,
                    // The gate holds Running without an attempt in flight
                    StepState::Running => !self.in_flight.contains_key(*id),
                    _ => false,
                })
                .map(|(id, _)| id.clone())
                .collect();
            for step_id in idle {
                run.set_state(
                    &step_id,
                    StepState::Skipped {
                        reason: SkipReason::RunAborted,
                    },
                );
            }
        }

        self.persist().await;
    }

    /// Publish the terminal event, close the log, persist
    async fn finalize(&mut self) {
        let (status, cause, output_keys) = {
            let run = self.run();
            let keys: Vec<String> = run.outputs.keys().cloned().collect();
            (run.status, run.cause.clone(), keys)
        };

        match status {
            RunStatus::Completed => {
                info!(run_id = %self.run_id, "Run completed");
                self.publish(None, EventKind::RunCompleted, json!({ "outputs": output_keys }));
            }
            _ => {
                let (step, kind, message) = match &cause {
                    Some(cause) => (cause.step_id.clone(), cause.kind, cause.message.clone()),
                    None => (None, ErrorKind::Cancelled, "run aborted".to_string()),
                };
                warn!(run_id = %self.run_id, "Run aborted: {}", message);
                self.publish(
                    None,
                    EventKind::RunAborted,
                    json!({ "step": step, "kind": kind.as_str(), "message": message }),
                );
            }
        }

        self.log.close();
        self.finalized = true;
        self.persist().await;
    }
}
