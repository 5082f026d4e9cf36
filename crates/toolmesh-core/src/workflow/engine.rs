//! Workflow Engine: stores definitions and runs executions.
//!
//! Each execution runs on its own tokio task driven by a [`StepRunner`].
//! The engine keeps a shared snapshot per execution for inspection and a
//! `watch` channel for pause / resume / cancel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::WorkflowError;
use crate::events::{EventChannel, WorkflowEvent};

use super::context::ExecutionContext;
use super::execution::{ExecutionStatus, WorkflowExecution};
use super::invoker::ToolInvoker;
use super::runner::{Control, HumanInputs, RunShared, StepRunner};
use super::schema::WorkflowDefinition;
use super::validate::validate_definition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Executions allowed to be pending, running or paused at once
    pub max_concurrent_executions: usize,
    /// Steps dispatched together when a list runs in parallel
    pub max_parallel_steps: usize,
    /// Default wait for `human_input` steps without their own timeout
    pub human_input_timeout_ms: u64,
    /// Finished executions kept for inspection, enforced whenever an
    /// execution starts. The oldest go first; `0` keeps them all.
    pub max_retained_executions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            max_parallel_steps: 5,
            human_input_timeout_ms: 300_000,
            max_retained_executions: 100,
        }
    }
}

struct RegisteredWorkflow {
    definition: Arc<WorkflowDefinition>,
    order: Vec<String>,
}

struct ExecutionRecord {
    snapshot: Arc<RwLock<WorkflowExecution>>,
    control: watch::Sender<Control>,
    done: watch::Receiver<bool>,
}

impl ExecutionRecord {
    fn read(&self) -> WorkflowExecution {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn status(&self) -> ExecutionStatus {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .status
    }
}

struct EngineInner {
    config: EngineConfig,
    invoker: Arc<dyn ToolInvoker>,
    workflows: RwLock<HashMap<String, RegisteredWorkflow>>,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
    human: HumanInputs,
    events: EventChannel<WorkflowEvent>,
    shutting_down: AtomicBool,
}

/// Handle to a started execution.
pub struct ExecutionHandle {
    execution_id: String,
    snapshot: Arc<RwLock<WorkflowExecution>>,
    task: JoinHandle<WorkflowExecution>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Current state without waiting.
    pub fn snapshot(&self) -> WorkflowExecution {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait for the execution to reach a terminal state.
    pub async fn wait(self) -> WorkflowExecution {
        match self.task.await {
            Ok(execution) => execution,
            Err(e) => {
                tracing::error!("[Workflow:{}] driver task ended abnormally: {}", self.execution_id, e);
                self.snapshot
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone()
            }
        }
    }
}

/// Cheaply cloneable engine handle.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                invoker,
                workflows: RwLock::new(HashMap::new()),
                executions: Mutex::new(HashMap::new()),
                human: Arc::new(Mutex::new(HashMap::new())),
                events: EventChannel::default(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    // ── Definitions ────────────────────────────────────────────────────

    /// Validate and store a definition. Nothing is stored on failure.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        let order = validate_definition(&definition)?;
        let mut workflows = self.workflows_mut();
        if workflows.contains_key(&definition.id) {
            return Err(WorkflowError::WorkflowExists(definition.id));
        }
        tracing::info!(
            "[WorkflowEngine] registered '{}' ({} steps, order: {})",
            definition.id,
            definition.steps.len(),
            order.join(" → ")
        );
        workflows.insert(
            definition.id.clone(),
            RegisteredWorkflow {
                definition: Arc::new(definition),
                order,
            },
        );
        Ok(())
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        self.workflows_mut()
            .remove(workflow_id)
            .map(|w| Arc::unwrap_or_clone(w.definition))
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.inner
            .workflows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(workflow_id)
            .map(|w| w.definition.as_ref().clone())
    }

    /// All registered definitions, sorted by id.
    pub fn workflows(&self) -> Vec<WorkflowDefinition> {
        let workflows = self
            .inner
            .workflows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<WorkflowDefinition> = workflows
            .values()
            .map(|w| w.definition.as_ref().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Top-level step ids in the order they are dispatched.
    pub fn execution_order(&self, workflow_id: &str) -> Option<Vec<String>> {
        self.inner
            .workflows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(workflow_id)
            .map(|w| w.order.clone())
    }

    // ── Executions ─────────────────────────────────────────────────────

    /// Start an execution on its own task and return immediately.
    pub fn start_execution(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionHandle, WorkflowError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(WorkflowError::ShuttingDown);
        }
        let definition = self
            .inner
            .workflows
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(workflow_id)
            .map(|w| w.definition.clone())
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;
        let inputs = resolve_inputs(&definition, inputs)?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let mut execution = WorkflowExecution::new(
            execution_id.clone(),
            definition.id.clone(),
            inputs.clone(),
        );
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        let snapshot = Arc::new(RwLock::new(execution));
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut executions = self.records();
            let active = executions
                .values()
                .filter(|r| !r.status().is_terminal())
                .count();
            let max = self.inner.config.max_concurrent_executions;
            if active >= max {
                return Err(WorkflowError::ConcurrencyLimit { max });
            }
            let keep = self.inner.config.max_retained_executions;
            if keep > 0 {
                evict_finished(&mut executions, keep);
            }
            executions.insert(
                execution_id.clone(),
                ExecutionRecord {
                    snapshot: snapshot.clone(),
                    control: control_tx,
                    done: done_rx,
                },
            );
        }

        tracing::info!(
            "[Workflow:{}] starting '{}'",
            execution_id,
            definition.display_name()
        );
        self.inner.events.emit(WorkflowEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            workflow_id: definition.id.clone(),
        });

        let deadline = definition
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let runner = StepRunner::new(RunShared::new(
            execution_id.clone(),
            definition.id.clone(),
            self.inner.invoker.clone(),
            self.inner.events.clone(),
            self.inner.human.clone(),
            self.inner.config.max_parallel_steps,
            Duration::from_millis(self.inner.config.human_input_timeout_ms),
            control_rx,
            deadline,
            snapshot.clone(),
            definition.parallel,
        ));
        let ctx = ExecutionContext::new(inputs, definition.variables.clone());
        let task = tokio::spawn(async move {
            let finished = runner.drive(definition, ctx).await;
            let _ = done_tx.send(true);
            finished
        });

        Ok(ExecutionHandle {
            execution_id,
            snapshot,
            task,
        })
    }

    /// Start an execution and wait for it to finish.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        Ok(self.start_execution(workflow_id, inputs)?.wait().await)
    }

    /// Request cancellation. In-flight steps are detached; the execution
    /// reaches `cancelled` at its next checkpoint.
    pub fn cancel_execution(&self, execution_id: &str) -> Result<(), WorkflowError> {
        let executions = self.records();
        let record = lookup(&executions, execution_id)?;
        let status = record.status();
        if status.is_terminal() {
            return Err(invalid_state(execution_id, "cancel", status));
        }
        record.control.send_replace(Control::Cancel);
        tracing::info!("[Workflow:{}] cancellation requested", execution_id);
        Ok(())
    }

    /// Stop dispatching new steps. Steps already running keep running.
    pub fn pause_execution(&self, execution_id: &str) -> Result<(), WorkflowError> {
        self.transition(
            execution_id,
            "pause",
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            Control::Pause,
        )?;
        self.inner.events.emit(WorkflowEvent::ExecutionPaused {
            execution_id: execution_id.to_string(),
        });
        Ok(())
    }

    pub fn resume_execution(&self, execution_id: &str) -> Result<(), WorkflowError> {
        self.transition(
            execution_id,
            "resume",
            ExecutionStatus::Paused,
            ExecutionStatus::Running,
            Control::Run,
        )?;
        self.inner.events.emit(WorkflowEvent::ExecutionResumed {
            execution_id: execution_id.to_string(),
        });
        Ok(())
    }

    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.records().get(execution_id).map(|r| r.read())
    }

    /// Every execution still held, oldest first.
    pub fn executions(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<WorkflowExecution> =
            self.records().values().map(|r| r.read()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Forget a finished execution. Live executions must be cancelled first.
    pub fn remove_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError> {
        let mut executions = self.records();
        let status = lookup(&executions, execution_id)?.status();
        if !status.is_terminal() {
            return Err(invalid_state(execution_id, "be removed", status));
        }
        let removed = executions
            .remove(execution_id)
            .ok_or_else(|| WorkflowError::UnknownExecution(execution_id.to_string()))?;
        Ok(removed.read())
    }

    /// Answer a pending `human_input` step. `step_id` is the id carried by
    /// the `HumanInputRequired` event.
    pub fn provide_human_input(
        &self,
        execution_id: &str,
        step_id: &str,
        value: Value,
    ) -> Result<(), WorkflowError> {
        lookup(&self.records(), execution_id)?;
        let sender = self
            .inner
            .human
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(execution_id.to_string(), step_id.to_string()));
        let no_pending = || WorkflowError::NoPendingInput {
            execution: execution_id.to_string(),
            step: step_id.to_string(),
        };
        sender.ok_or_else(no_pending)?.send(value).map_err(|_| no_pending())
    }

    /// Cancel every live execution, wait for them to settle, then close the
    /// event channel.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiting: Vec<watch::Receiver<bool>> = {
            let executions = self.records();
            executions
                .values()
                .filter(|r| !r.status().is_terminal())
                .map(|r| {
                    r.control.send_replace(Control::Cancel);
                    r.done.clone()
                })
                .collect()
        };
        tracing::info!("[WorkflowEngine] shutting down ({} live executions)", waiting.len());
        for mut done in waiting {
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.inner.events.close();
    }

    fn transition(
        &self,
        execution_id: &str,
        action: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        control: Control,
    ) -> Result<(), WorkflowError> {
        let executions = self.records();
        let record = lookup(&executions, execution_id)?;
        let mut snapshot = record
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if snapshot.status != from {
            return Err(invalid_state(execution_id, action, snapshot.status));
        }
        snapshot.status = to;
        record.control.send_replace(control);
        tracing::info!("[Workflow:{}] {} → {}", execution_id, from, to);
        Ok(())
    }

    fn workflows_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RegisteredWorkflow>> {
        self.inner
            .workflows
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ExecutionRecord>> {
        self.inner
            .executions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drop the oldest finished records until at most `keep` remain.
fn evict_finished(executions: &mut HashMap<String, ExecutionRecord>, keep: usize) {
    let mut finished: Vec<(chrono::DateTime<Utc>, String)> = executions
        .iter()
        .filter_map(|(id, record)| {
            let execution = record.read();
            execution
                .status
                .is_terminal()
                .then(|| (execution.created_at, id.clone()))
        })
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        executions.remove(&id);
        tracing::debug!("[Workflow:{}] evicted finished execution", id);
    }
}

fn lookup<'a>(
    executions: &'a HashMap<String, ExecutionRecord>,
    execution_id: &str,
) -> Result<&'a ExecutionRecord, WorkflowError> {
    executions
        .get(execution_id)
        .ok_or_else(|| WorkflowError::UnknownExecution(execution_id.to_string()))
}

fn invalid_state(execution_id: &str, action: &str, status: ExecutionStatus) -> WorkflowError {
    WorkflowError::InvalidState {
        execution: execution_id.to_string(),
        action: action.to_string(),
        status: status.to_string(),
    }
}

/// Apply declared defaults and reject missing required inputs. Undeclared
/// inputs pass through untouched.
fn resolve_inputs(
    definition: &WorkflowDefinition,
    mut inputs: Map<String, Value>,
) -> Result<Map<String, Value>, WorkflowError> {
    for declared in &definition.inputs {
        if inputs.contains_key(&declared.name) {
            continue;
        }
        match &declared.default {
            Some(default) => {
                inputs.insert(declared.name.clone(), default.clone());
            }
            None if declared.required => {
                return Err(WorkflowError::MissingInput(declared.name.clone()));
            }
            None => {}
        }
    }
    Ok(inputs)
}
