//! The orchestrator: a step state machine driven by bus events.
//!
//! # Execution flow
//!
//! 1. `start` checks every brick config against the registry, then enters
//!    the initial step.
//! 2. Entering a step tears down the previous step (listeners removed,
//!    bricks destroyed, pending work aborted), bumps the generation, creates
//!    the step's bricks, subscribes to `complete:`, `error:` and `trigger:`
//!    for each, records the assistant message and runs every `execute()`
//!    once for that generation.
//! 3. Bus handlers only forward signals into a channel tagged with the
//!    generation that installed them. `process_next` pulls one signal,
//!    drops it if its generation is stale, and applies it.
//! 4. On completion the result is merged, then the next step is resolved:
//!    brick hint first, then conditions in declaration order, then the
//!    static or computed `nextStep`. Conditions and `nextStep` only apply
//!    once every blocking brick of the step has completed.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use brickflow_types::brick::RenderDescriptor;
use brickflow_types::error::{BrickError, BrickErrorKind};
use brickflow_types::event::{
    BrickTopic, CompletePayload, StepChangedPayload, WORKFLOW_FAILED_TOPIC,
    WORKFLOW_FINISHED_TOPIC, WORKFLOW_STEP_TOPIC,
};
use brickflow_types::workflow::{
    ChatMessage, ErrorPolicy, NextStep, RunStatus, StepConfig, WorkflowConfig, WorkflowSnapshot,
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::brick::{Brick, BrickContext, BrickRegistry, RegistryError};
use crate::data::WorkflowData;
use crate::event::{EventBus, SubscriptionId};
use crate::expression::ConditionEvaluator;
use crate::template::interpolate;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::loader::check_bricks;

// ---------------------------------------------------------------------------
// Errors and updates
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow run has already been started")]
    AlreadyStarted,

    #[error("workflow run is not active (status {0:?})")]
    NotRunning(RunStatus),

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("no active brick '{0}' in the current step")]
    UnknownBrick(String),

    #[error("pre-flight check failed: {}", .0.join("; "))]
    Preflight(Vec<String>),

    #[error("snapshot belongs to workflow '{found}', expected '{expected}'")]
    SnapshotMismatch { expected: String, found: String },

    #[error("no checkpoint store configured")]
    NoCheckpointStore,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// What one call to [`WorkflowEngine::process_next`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    /// The run moved to another step (or re-entered the same one).
    Transitioned { from: String, to: String },
    /// A brick completed; the run stays on the current step.
    BrickCompleted { brick_id: String },
    /// A brick failed; the run stays on the current step.
    BrickFailed { brick_id: String, error: BrickError },
    /// A `trigger:<id>` event was handed to its brick.
    TriggerDispatched { brick_id: String },
    /// The run reached a step with no outgoing transition.
    Finished { step: String },
    /// A brick failed on a step whose error policy is `stop`.
    Stopped { brick_id: String, error: BrickError },
    /// The signal belonged to a previous step entry or an inactive brick.
    Ignored,
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

enum Signal {
    /// The step has no blocking bricks; resolve its transition right away.
    Settled { generation: u64 },
    Completed {
        generation: u64,
        brick_id: String,
        payload: CompletePayload,
    },
    Failed {
        generation: u64,
        brick_id: String,
        error: BrickError,
    },
    Trigger {
        generation: u64,
        brick_id: String,
        payload: Value,
    },
}

impl Signal {
    fn generation(&self) -> u64 {
        match self {
            Signal::Settled { generation }
            | Signal::Completed { generation, .. }
            | Signal::Failed { generation, .. }
            | Signal::Trigger { generation, .. } => *generation,
        }
    }
}

/// A brick of the current step and the work running against it.
///
/// Triggers wait until no `execute()` is outstanding and then run one at a
/// time, so a trigger never reaches a brick that has not started yet.
struct ActiveBrick {
    brick: Arc<dyn Brick>,
    subscriptions: Vec<SubscriptionId>,
    tasks: Vec<JoinHandle<()>>,
    /// Number of `execute()` calls that have not resolved.
    executing: Arc<watch::Sender<usize>>,
    triggers: Arc<AsyncMutex<()>>,
}

/// Marks one outstanding `execute()`; released even if the task is aborted.
struct PendingExecute(Arc<watch::Sender<usize>>);

impl PendingExecute {
    fn new(executing: &Arc<watch::Sender<usize>>) -> Self {
        executing.send_modify(|n| *n += 1);
        Self(executing.clone())
    }
}

impl Drop for PendingExecute {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl ActiveBrick {
    fn new(brick: Arc<dyn Brick>, subscriptions: Vec<SubscriptionId>) -> Self {
        Self {
            brick,
            subscriptions,
            tasks: Vec::new(),
            executing: Arc::new(watch::Sender::new(0)),
            triggers: Arc::new(AsyncMutex::new(())),
        }
    }

    fn spawn(&mut self, work: impl Future<Output = ()> + Send + 'static) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(work));
    }

    fn spawn_execute(&mut self) {
        let brick = self.brick.clone();
        let pending = PendingExecute::new(&self.executing);
        self.spawn(async move {
            let _pending = pending;
            let result = brick.execute().await;
            tracing::debug!(
                brick_id = brick.id(),
                success = result.success,
                waiting = result.is_waiting(),
                "brick execute resolved"
            );
        });
    }

    fn spawn_trigger(&mut self, payload: Value) {
        let brick = self.brick.clone();
        let mut executing = self.executing.subscribe();
        let triggers = self.triggers.clone();
        self.spawn(async move {
            let ready = executing.wait_for(|pending| *pending == 0).await.is_ok();
            if !ready {
                return;
            }
            let _turn = triggers.lock().await;
            let result = brick.trigger(payload).await;
            tracing::debug!(brick_id = brick.id(), success = result.success, "brick trigger resolved");
        });
    }

    fn release(self, bus: &EventBus) {
        for id in self.subscriptions {
            bus.off_by_id(id);
        }
        self.brick.destroy();
        for task in self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives one run of a workflow.
///
/// The engine owns the bricks of the current step. The host feeds user
/// actions in as `trigger:<id>` events (or through [`Self::send_trigger`])
/// and calls [`Self::process_next`] to apply whatever happened.
pub struct WorkflowEngine {
    workflow: Arc<WorkflowConfig>,
    registry: Arc<BrickRegistry>,
    ctx: BrickContext,
    checkpoints: Option<CheckpointManager>,
    run_id: Uuid,
    status: RunStatus,
    current_step: Option<String>,
    generation: u64,
    /// `(step, generation)` pairs whose bricks have been executed.
    executed: HashSet<(String, u64)>,
    /// Bricks of the current step that have completed.
    completed: HashSet<String>,
    active: Vec<ActiveBrick>,
    chat: Vec<ChatMessage>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
}

impl WorkflowEngine {
    pub fn new(workflow: Arc<WorkflowConfig>, registry: Arc<BrickRegistry>, ctx: BrickContext) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            workflow,
            registry,
            ctx,
            checkpoints: None,
            run_id: Uuid::now_v7(),
            status: RunStatus::NotStarted,
            current_step: None,
            generation: 0,
            executed: HashSet::new(),
            completed: HashSet::new(),
            active: Vec::new(),
            chat: Vec::new(),
            signals_tx,
            signals_rx,
        }
    }

    /// Persist a snapshot after every completion on `autoSave` steps.
    pub fn with_checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    // -- Run control --------------------------------------------------------

    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.status != RunStatus::NotStarted {
            return Err(EngineError::AlreadyStarted);
        }
        self.preflight()?;
        tracing::info!(
            run_id = %self.run_id,
            workflow_id = %self.workflow.id,
            "starting workflow run"
        );
        let initial = self.workflow.initial_step.clone();
        self.enter_step(&initial, None, true).await
    }

    /// Continue a run from a snapshot: data, chat history and current step
    /// are restored and the current step is entered again.
    pub async fn resume(&mut self, snapshot: WorkflowSnapshot) -> Result<(), EngineError> {
        if self.status != RunStatus::NotStarted {
            return Err(EngineError::AlreadyStarted);
        }
        if snapshot.workflow_id != self.workflow.id {
            return Err(EngineError::SnapshotMismatch {
                expected: self.workflow.id.clone(),
                found: snapshot.workflow_id,
            });
        }
        if self.workflow.step(&snapshot.current_step).is_none() {
            return Err(EngineError::UnknownStep(snapshot.current_step));
        }
        self.preflight()?;

        tracing::info!(
            run_id = %snapshot.run_id,
            workflow_id = %self.workflow.id,
            step_id = %snapshot.current_step,
            "resuming workflow run"
        );
        self.run_id = snapshot.run_id;
        self.ctx.data.replace(snapshot.data);
        self.chat = snapshot.chat_history;
        self.enter_step(&snapshot.current_step, None, false).await
    }

    /// Resume from the latest stored snapshot. Returns `false` when there is
    /// none.
    pub async fn resume_latest(&mut self) -> Result<bool, EngineError> {
        let checkpoints = self.checkpoints.clone().ok_or(EngineError::NoCheckpointStore)?;
        match checkpoints.load_latest(&self.workflow.id).await? {
            Some(snapshot) => {
                self.resume(snapshot).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait for the next signal and apply it.
    pub async fn process_next(&mut self) -> Result<EngineUpdate, EngineError> {
        let Some(signal) = self.signals_rx.recv().await else {
            return Ok(EngineUpdate::Ignored);
        };
        self.apply(signal).await
    }

    /// Reset one brick of the current step and execute it again.
    pub fn retry_brick(&mut self, brick_id: &str) -> Result<(), EngineError> {
        self.ensure_running()?;
        let active = self
            .active
            .iter_mut()
            .find(|a| a.brick.id() == brick_id)
            .ok_or_else(|| EngineError::UnknownBrick(brick_id.to_string()))?;
        tracing::debug!(brick_id, generation = self.generation, "retrying brick");
        active.brick.reset();
        self.completed.remove(brick_id);
        active.spawn_execute();
        Ok(())
    }

    /// Enter the current step again from scratch. Also recovers a run that
    /// a `stop` error policy ended.
    pub async fn reenter_current_step(&mut self) -> Result<(), EngineError> {
        let step = self
            .current_step
            .clone()
            .ok_or(EngineError::NotRunning(self.status))?;
        self.enter_step(&step, Some(step.clone()), true).await
    }

    /// Emit `trigger:<id>` on the bus.
    pub fn send_trigger(&self, brick_id: &str, payload: Value) {
        self.ctx
            .bus
            .emit(&BrickTopic::Trigger.for_brick(brick_id), &payload);
    }

    // -- Accessors ----------------------------------------------------------

    pub fn workflow(&self) -> &WorkflowConfig {
        &self.workflow
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn chat_history(&self) -> &[ChatMessage] {
        &self.chat
    }

    pub fn data(&self) -> &WorkflowData {
        &self.ctx.data
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    pub fn context(&self) -> &BrickContext {
        &self.ctx
    }

    /// Render descriptors of the current step's bricks, in declaration order.
    pub fn render_current_step(&self) -> Vec<RenderDescriptor> {
        self.active.iter().filter_map(|a| a.brick.render()).collect()
    }

    /// Snapshot of the run as it stands, once a step has been entered.
    pub fn snapshot(&self) -> Option<WorkflowSnapshot> {
        Some(WorkflowSnapshot {
            workflow_id: self.workflow.id.clone(),
            run_id: self.run_id,
            current_step: self.current_step.clone()?,
            data: self.ctx.data.snapshot(),
            chat_history: self.chat.clone(),
            saved_at: Utc::now(),
        })
    }

    // -- Step entry and exit ------------------------------------------------

    fn preflight(&self) -> Result<(), EngineError> {
        let failures = check_bricks(&self.workflow, &self.registry);
        if failures.is_empty() {
            return Ok(());
        }
        Err(EngineError::Preflight(
            failures.iter().map(ToString::to_string).collect(),
        ))
    }

    async fn enter_step(
        &mut self,
        step_id: &str,
        from: Option<String>,
        record_message: bool,
    ) -> Result<(), EngineError> {
        let workflow = self.workflow.clone();
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::UnknownStep(step_id.to_string()))?;

        self.teardown();
        self.generation += 1;
        let generation = self.generation;
        self.executed.retain(|(executed_step, _)| executed_step != step_id);
        self.completed.clear();
        self.current_step = Some(step_id.to_string());
        self.status = RunStatus::Running;

        if record_message {
            if let Some(message) = &step.assistant_message {
                let content = interpolate(message, &self.ctx.data.snapshot());
                self.chat.push(ChatMessage::assistant(content, step_id));
            }
        }

        for config in &step.bricks {
            let brick = match self.registry.create(config.clone(), self.ctx.clone()).await {
                Ok(brick) => brick,
                Err(e) => {
                    self.abort_run(step_id, &config.id, &BrickError::from(e.clone()));
                    return Err(e.into());
                }
            };
            let subscriptions = self.subscribe(brick.id(), generation);
            self.active.push(ActiveBrick::new(brick, subscriptions));
        }

        tracing::info!(
            run_id = %self.run_id,
            step_id,
            from = from.as_deref().unwrap_or("-"),
            generation,
            bricks = self.active.len(),
            "entered step"
        );
        self.ctx.bus.emit_json(
            WORKFLOW_STEP_TOPIC,
            &StepChangedPayload {
                from,
                to: step_id.to_string(),
                generation,
            },
        );

        if self.executed.insert((step_id.to_string(), generation)) {
            for active in &mut self.active {
                active.spawn_execute();
            }
        }
        if !self.active.iter().any(|a| a.brick.blocks_step()) {
            let _ = self.signals_tx.send(Signal::Settled { generation });
        }
        Ok(())
    }

    fn subscribe(&self, brick_id: &str, generation: u64) -> Vec<SubscriptionId> {
        let bus = &self.ctx.bus;

        let tx = self.signals_tx.clone();
        let id = brick_id.to_string();
        let on_complete = bus.on(&BrickTopic::Complete.for_brick(brick_id), move |payload| {
            let payload = serde_json::from_value::<CompletePayload>(payload.clone())
                .unwrap_or_else(|_| CompletePayload::with_data(payload.clone()));
            let _ = tx.send(Signal::Completed {
                generation,
                brick_id: id.clone(),
                payload,
            });
        });

        let tx = self.signals_tx.clone();
        let id = brick_id.to_string();
        let on_error = bus.on(&BrickTopic::Error.for_brick(brick_id), move |payload| {
            let _ = tx.send(Signal::Failed {
                generation,
                brick_id: id.clone(),
                error: BrickError::from_payload(payload),
            });
        });

        let tx = self.signals_tx.clone();
        let id = brick_id.to_string();
        let on_trigger = bus.on(&BrickTopic::Trigger.for_brick(brick_id), move |payload| {
            let _ = tx.send(Signal::Trigger {
                generation,
                brick_id: id.clone(),
                payload: payload.clone(),
            });
        });

        vec![on_complete, on_error, on_trigger]
    }

    /// Remove the current step's listeners and destroy its bricks.
    fn teardown(&mut self) {
        for active in self.active.drain(..) {
            active.release(&self.ctx.bus);
        }
    }

    fn abort_run(&mut self, step_id: &str, brick_id: &str, error: &BrickError) {
        self.teardown();
        self.status = RunStatus::Failed;
        tracing::error!(
            run_id = %self.run_id,
            step_id,
            brick_id,
            error = %error.message,
            "workflow run failed"
        );
        self.ctx.bus.emit(
            WORKFLOW_FAILED_TOPIC,
            &json!({
                "workflowId": self.workflow.id,
                "runId": self.run_id,
                "step": step_id,
                "brickId": brick_id,
                "error": error,
            }),
        );
    }

    // -- Signal handling ----------------------------------------------------

    async fn apply(&mut self, signal: Signal) -> Result<EngineUpdate, EngineError> {
        if signal.generation() != self.generation || self.status != RunStatus::Running {
            tracing::debug!(
                signal_generation = signal.generation(),
                generation = self.generation,
                "discarding stale signal"
            );
            return Ok(EngineUpdate::Ignored);
        }

        match signal {
            Signal::Settled { .. } => {
                let step_id = self.current_step_id()?;
                self.advance(&step_id, None).await
            }
            Signal::Trigger {
                brick_id, payload, ..
            } => match self.active.iter_mut().find(|a| a.brick.id() == brick_id) {
                Some(active) => {
                    tracing::debug!(brick_id = %brick_id, "dispatching trigger");
                    active.spawn_trigger(payload);
                    Ok(EngineUpdate::TriggerDispatched { brick_id })
                }
                None => Ok(EngineUpdate::Ignored),
            },
            Signal::Completed {
                brick_id, payload, ..
            } => self.on_complete(brick_id, payload).await,
            Signal::Failed {
                brick_id, error, ..
            } => self.on_error(brick_id, error),
        }
    }

    async fn on_complete(
        &mut self,
        brick_id: String,
        payload: CompletePayload,
    ) -> Result<EngineUpdate, EngineError> {
        if !self.is_active(&brick_id) {
            return Ok(EngineUpdate::Ignored);
        }
        let step_id = self.current_step_id()?;
        self.completed.insert(brick_id.clone());

        if !payload.updates.is_empty() {
            self.ctx.data.merge(payload.updates);
        }
        if let Some(message) = payload.user_message {
            self.chat.push(ChatMessage::user(message, &step_id, &brick_id));
        }
        tracing::debug!(step_id = %step_id, brick_id = %brick_id, action = ?payload.action, "brick completed");

        match self.advance(&step_id, payload.next_step).await? {
            EngineUpdate::Ignored => Ok(EngineUpdate::BrickCompleted { brick_id }),
            update => Ok(update),
        }
    }

    /// Resolve and apply the next step, if one applies. Returns `Ignored`
    /// when the run stays where it is.
    async fn advance(
        &mut self,
        step_id: &str,
        hint: Option<String>,
    ) -> Result<EngineUpdate, EngineError> {
        let workflow = self.workflow.clone();
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::UnknownStep(step_id.to_string()))?;

        let settled = self.blocking_settled();
        let target = match hint {
            Some(target) => Some(target),
            None if settled => self.resolve_transition(step),
            None => None,
        };

        let update = match target {
            Some(target) => {
                if workflow.step(&target).is_none() {
                    tracing::warn!(step_id, target = %target, "transition to unknown step");
                    return Err(EngineError::UnknownStep(target));
                }
                self.enter_step(&target, Some(step_id.to_string()), true).await?;
                EngineUpdate::Transitioned {
                    from: step_id.to_string(),
                    to: target,
                }
            }
            None if settled && step.next_step.is_none() && step.conditions.is_empty() => {
                self.finish(step_id)
            }
            None => {
                if settled {
                    tracing::debug!(step_id, "no transition applies; staying on step");
                }
                EngineUpdate::Ignored
            }
        };

        if step.auto_save {
            self.save_checkpoint();
        }
        Ok(update)
    }

    fn resolve_transition(&self, step: &StepConfig) -> Option<String> {
        let data = self.ctx.data.snapshot();
        let evaluator = ConditionEvaluator::new();

        for condition in &step.conditions {
            match evaluator.evaluate_bool(&condition.condition, &data) {
                Ok(true) => return Some(condition.next_step.clone()),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    step_id = %step.id,
                    condition = %condition.condition,
                    error = %e,
                    "condition failed to evaluate; treating as false"
                ),
            }
        }

        match &step.next_step {
            Some(NextStep::Static(target)) => Some(target.clone()),
            Some(NextStep::Computed { expression }) => {
                match evaluator.evaluate_step_id(expression, &data) {
                    Ok(target) => target,
                    Err(e) => {
                        tracing::warn!(step_id = %step.id, %expression, error = %e, "computed nextStep failed");
                        None
                    }
                }
            }
            None => None,
        }
    }

    fn on_error(&mut self, brick_id: String, error: BrickError) -> Result<EngineUpdate, EngineError> {
        if !self.is_active(&brick_id) {
            return Ok(EngineUpdate::Ignored);
        }
        let step_id = self.current_step_id()?;
        self.completed.remove(&brick_id);

        let policy = self
            .workflow
            .step(&step_id)
            .map(|s| s.error_policy)
            .unwrap_or_default();
        if policy == ErrorPolicy::Continue || error.kind == BrickErrorKind::Validation {
            tracing::debug!(
                step_id = %step_id,
                brick_id = %brick_id,
                kind = %error.kind,
                "brick error; staying on step"
            );
            return Ok(EngineUpdate::BrickFailed { brick_id, error });
        }

        self.abort_run(&step_id, &brick_id, &error);
        Ok(EngineUpdate::Stopped { brick_id, error })
    }

    fn finish(&mut self, step_id: &str) -> EngineUpdate {
        self.status = RunStatus::Finished;
        tracing::info!(run_id = %self.run_id, step_id, "workflow run finished");
        self.ctx.bus.emit(
            WORKFLOW_FINISHED_TOPIC,
            &json!({
                "workflowId": self.workflow.id,
                "runId": self.run_id,
                "step": step_id,
            }),
        );
        EngineUpdate::Finished {
            step: step_id.to_string(),
        }
    }

    fn save_checkpoint(&self) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        if let Some(snapshot) = self.snapshot() {
            checkpoints.submit(snapshot);
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn blocking_settled(&self) -> bool {
        self.active
            .iter()
            .filter(|a| a.brick.blocks_step())
            .all(|a| self.completed.contains(a.brick.id()))
    }

    fn is_active(&self, brick_id: &str) -> bool {
        self.active.iter().any(|a| a.brick.id() == brick_id)
    }

    fn current_step_id(&self) -> Result<String, EngineError> {
        self.current_step
            .clone()
            .ok_or(EngineError::NotRunning(self.status))
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        match self.status {
            RunStatus::Running => Ok(()),
            status => Err(EngineError::NotRunning(status)),
        }
    }
}

impl Drop for WorkflowEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow_id", &self.workflow.id)
            .field("run_id", &self.run_id)
            .field("status", &self.status)
            .field("current_step", &self.current_step)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
