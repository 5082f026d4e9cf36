//! Step scheduling for one execution.
//!
//! [`StepRunner::run_list`] drives a single step list: it dispatches ready
//! steps into a `JoinSet`, applies each step's error policy as results come
//! back, and checks the pause/cancel/deadline checkpoint between dispatches.
//! `loop` and `parallel` steps call back into `run_list` for their bodies.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::events::{EventChannel, WorkflowEvent};

use super::context::ExecutionContext;
use super::execution::{ExecutionStatus, StepStatus, WorkflowExecution};
use super::expr::eval::type_name;
use super::expr::{self, evaluate_bool};
use super::invoker::ToolInvoker;
use super::schema::{ErrorPolicy, RetryPolicy, StepKind, WorkflowDefinition, WorkflowStep};
use super::template::{render_text, render_value};
use super::validate::topological_order;

/// Control signal published by the engine to a running execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Pause,
    Cancel,
}

/// Outstanding `human_input` requests keyed by (execution id, step id).
pub(crate) type HumanInputs = Arc<Mutex<HashMap<(String, String), oneshot::Sender<Value>>>>;

/// Why a step list stopped early.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Abort {
    Failed { step: String, error: String },
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
enum StepFailure {
    Error(String),
    Abort(Abort),
}

impl From<expr::ExprError> for StepFailure {
    fn from(e: expr::ExprError) -> Self {
        StepFailure::Error(e.to_string())
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub(crate) struct RunShared {
    pub execution_id: String,
    pub workflow_id: String,
    pub invoker: Arc<dyn ToolInvoker>,
    pub events: EventChannel<WorkflowEvent>,
    pub human: HumanInputs,
    pub max_parallel_steps: usize,
    pub human_input_timeout: Duration,
    pub control: watch::Receiver<Control>,
    pub deadline: Option<Instant>,
    pub snapshot: Arc<RwLock<WorkflowExecution>>,
    pub parallel: bool,
    halted: AtomicBool,
}

impl RunShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: String,
        workflow_id: String,
        invoker: Arc<dyn ToolInvoker>,
        events: EventChannel<WorkflowEvent>,
        human: HumanInputs,
        max_parallel_steps: usize,
        human_input_timeout: Duration,
        control: watch::Receiver<Control>,
        deadline: Option<Instant>,
        snapshot: Arc<RwLock<WorkflowExecution>>,
        parallel: bool,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            invoker,
            events,
            human,
            max_parallel_steps,
            human_input_timeout,
            control,
            deadline,
            snapshot,
            parallel,
            halted: AtomicBool::new(false),
        }
    }
}

#[derive(Clone)]
pub(crate) struct StepRunner {
    shared: Arc<RunShared>,
}

impl StepRunner {
    pub fn new(shared: RunShared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    fn exec_id(&self) -> String {
        self.shared.execution_id.clone()
    }

    fn halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    fn halt(&self) {
        self.shared.halted.store(true, Ordering::SeqCst);
    }

    fn update_snapshot(&self, f: impl FnOnce(&mut WorkflowExecution)) {
        let mut guard = self
            .shared
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard);
    }

    /// Run a whole definition and finalize the execution record.
    pub async fn drive(self, definition: Arc<WorkflowDefinition>, mut ctx: ExecutionContext) -> WorkflowExecution {
        let outcome = self
            .run_list(&definition.steps, &mut ctx, definition.parallel, None)
            .await;
        self.halt();

        let exec_id = self.exec_id();
        self.shared
            .human
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(execution, _), _| execution != &exec_id);

        let (status, error) = match outcome {
            Ok(()) => (ExecutionStatus::Completed, None),
            Err(Abort::Failed { step, error }) => (
                ExecutionStatus::Failed,
                Some(format!("Step '{}' failed: {}", step, error)),
            ),
            Err(Abort::Cancelled) => (ExecutionStatus::Cancelled, None),
            Err(Abort::TimedOut) => (
                ExecutionStatus::Failed,
                Some(format!(
                    "Execution timed out after {}ms",
                    definition.timeout_ms.unwrap_or_default()
                )),
            ),
        };

        let map = ctx.to_map();
        let mut outputs = Map::new();
        for (name, source) in &definition.outputs {
            let value = expr::evaluate_str(source, &map).unwrap_or_else(|e| {
                tracing::debug!(
                    "[Workflow:{}] output '{}' evaluated to null: {}",
                    exec_id,
                    name,
                    e
                );
                Value::Null
            });
            outputs.insert(name.clone(), value);
        }

        let mut finished = None;
        self.update_snapshot(|exec| {
            exec.status = status;
            exec.error = error.clone();
            exec.outputs = outputs;
            exec.ended_at = Some(Utc::now());
            finished = Some(exec.clone());
        });

        let workflow_id = self.shared.workflow_id.clone();
        match status {
            ExecutionStatus::Completed => {
                tracing::info!("[Workflow:{}] completed", exec_id);
                self.shared.events.emit(WorkflowEvent::ExecutionCompleted {
                    execution_id: exec_id.clone(),
                    workflow_id,
                });
            }
            ExecutionStatus::Cancelled => {
                tracing::info!("[Workflow:{}] cancelled", exec_id);
                self.shared.events.emit(WorkflowEvent::ExecutionCancelled {
                    execution_id: exec_id.clone(),
                    workflow_id,
                });
            }
            _ => {
                let error = error.unwrap_or_default();
                tracing::warn!("[Workflow:{}] failed: {}", exec_id, error);
                self.shared.events.emit(WorkflowEvent::ExecutionFailed {
                    execution_id: exec_id.clone(),
                    workflow_id,
                    error,
                });
            }
        }

        finished.unwrap_or_else(|| {
            WorkflowExecution::new(exec_id, self.shared.workflow_id.clone(), Map::new())
        })
    }

    /// Run one step list to completion. `scope` is `None` for the top-level
    /// list, whose outcomes are mirrored into the execution record.
    pub fn run_list<'a>(
        &'a self,
        steps: &'a [WorkflowStep],
        ctx: &'a mut ExecutionContext,
        parallel: bool,
        scope: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), Abort>> {
        Box::pin(async move {
            let result = self.run_list_inner(steps, ctx, parallel, scope).await;
            if result.is_err() && scope.is_none() {
                self.halt();
            }
            result
        })
    }

    async fn run_list_inner(
        &self,
        steps: &[WorkflowStep],
        ctx: &mut ExecutionContext,
        parallel: bool,
        scope: Option<&str>,
    ) -> Result<(), Abort> {
        let order = topological_order(steps).map_err(|e| Abort::Failed {
            step: scope.unwrap_or("workflow").to_string(),
            error: e.to_string(),
        })?;
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let limit = if parallel {
            self.shared.max_parallel_steps.max(1)
        } else {
            1
        };

        let mut states = vec![StepStatus::Pending; steps.len()];
        let mut join: JoinSet<(usize, Result<Value, StepFailure>)> = JoinSet::new();
        let mut control = self.shared.control.clone();

        loop {
            if let Err(abort) = self.checkpoint(&mut control).await {
                join.detach_all();
                return Err(abort);
            }

            let mut progressed = false;
            for &i in &order {
                if join.len() >= limit {
                    break;
                }
                if states[i] != StepStatus::Pending {
                    continue;
                }
                let step = &steps[i];
                let ready = step.depends_on.iter().all(|dep| {
                    index
                        .get(dep.as_str())
                        .map(|&d| states[d].is_terminal())
                        .unwrap_or(true)
                });
                if !ready {
                    if !parallel {
                        // Topological order: nothing later can be ready either.
                        break;
                    }
                    continue;
                }

                let qid = qualify(scope, &step.id);
                match gate(step, &ctx.to_map()) {
                    Ok(None) => {}
                    Ok(Some(reason)) => {
                        states[i] = self.skip(step, &qid, reason, ctx, scope.is_none());
                        progressed = true;
                        continue;
                    }
                    Err(error) => {
                        progressed = true;
                        match self.settle(step, &qid, Err(StepFailure::Error(error)), ctx, scope) {
                            Ok(status) => {
                                states[i] = status;
                                continue;
                            }
                            Err(abort) => {
                                join.detach_all();
                                return Err(abort);
                            }
                        }
                    }
                }

                states[i] = StepStatus::Running;
                progressed = true;
                tracing::debug!(
                    "[Workflow:{}] starting {} step '{}'",
                    self.shared.execution_id,
                    step.kind.type_name(),
                    qid
                );
                self.shared.events.emit(WorkflowEvent::StepStarted {
                    execution_id: self.exec_id(),
                    step_id: qid.clone(),
                });
                let runner = self.clone();
                let step = step.clone();
                let snapshot = ctx.clone();
                join.spawn(async move { (i, runner.execute(step, snapshot, qid).await) });
            }

            if join.is_empty() {
                if states.iter().all(|s| s.is_terminal()) || !progressed {
                    return Ok(());
                }
                continue;
            }

            tokio::select! {
                joined = join.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (i, outcome) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            join.detach_all();
                            return Err(Abort::Failed {
                                step: scope.unwrap_or("workflow").to_string(),
                                error: format!("step task failed: {}", e),
                            });
                        }
                    };
                    let step = &steps[i];
                    let qid = qualify(scope, &step.id);
                    match self.settle(step, &qid, outcome, ctx, scope) {
                        Ok(status) => states[i] = status,
                        Err(abort) => {
                            join.detach_all();
                            return Err(abort);
                        }
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        join.detach_all();
                        return Err(Abort::Cancelled);
                    }
                }
                _ = until(self.shared.deadline) => {
                    join.detach_all();
                    return Err(Abort::TimedOut);
                }
            }
        }
    }

    /// Block while paused; fail on cancel, halt or an expired deadline.
    async fn checkpoint(&self, control: &mut watch::Receiver<Control>) -> Result<(), Abort> {
        loop {
            if self.halted() {
                return Err(Abort::Cancelled);
            }
            if let Some(deadline) = self.shared.deadline {
                if Instant::now() >= deadline {
                    return Err(Abort::TimedOut);
                }
            }
            let state = *control.borrow_and_update();
            match state {
                Control::Run => return Ok(()),
                Control::Cancel => return Err(Abort::Cancelled),
                Control::Pause => {
                    tokio::select! {
                        changed = control.changed() => {
                            if changed.is_err() {
                                return Err(Abort::Cancelled);
                            }
                        }
                        _ = until(self.shared.deadline) => return Err(Abort::TimedOut),
                    }
                }
            }
        }
    }

    fn skip(
        &self,
        step: &WorkflowStep,
        qid: &str,
        reason: String,
        ctx: &mut ExecutionContext,
        top_level: bool,
    ) -> StepStatus {
        ctx.record_status(&step.id, StepStatus::Skipped);
        if top_level {
            self.update_snapshot(|exec| exec.record(&step.id, StepStatus::Skipped, None, None));
        }
        tracing::debug!("[Workflow:{}] skipped '{}': {}", self.shared.execution_id, qid, reason);
        self.shared.events.emit(WorkflowEvent::StepSkipped {
            execution_id: self.exec_id(),
            step_id: qid.to_string(),
            reason,
        });
        StepStatus::Skipped
    }

    /// Record a finished step and apply its error policy.
    fn settle(
        &self,
        step: &WorkflowStep,
        qid: &str,
        outcome: Result<Value, StepFailure>,
        ctx: &mut ExecutionContext,
        scope: Option<&str>,
    ) -> Result<StepStatus, Abort> {
        if self.halted() {
            return Err(Abort::Cancelled);
        }
        let top_level = scope.is_none();

        let error = match outcome {
            Ok(result) => {
                ctx.record_result(&step.id, result.clone());
                ctx.record_status(&step.id, StepStatus::Completed);
                if top_level {
                    let recorded = result.clone();
                    self.update_snapshot(|exec| {
                        exec.record(&step.id, StepStatus::Completed, Some(recorded), None)
                    });
                }
                self.shared.events.emit(WorkflowEvent::StepCompleted {
                    execution_id: self.exec_id(),
                    step_id: qid.to_string(),
                    result,
                });
                return Ok(StepStatus::Completed);
            }
            Err(StepFailure::Abort(abort)) => return Err(abort),
            Err(StepFailure::Error(error)) => error,
        };

        ctx.record_error(&step.id, &error);
        if step.on_error == ErrorPolicy::Skip {
            return Ok(self.skip(step, qid, error, ctx, top_level));
        }

        ctx.record_status(&step.id, StepStatus::Failed);
        if top_level {
            self.update_snapshot(|exec| exec.record(&step.id, StepStatus::Failed, None, Some(&error)));
        }
        let fallback = match &step.on_error {
            ErrorPolicy::Fallback(id) => Some(qualify(scope, id)),
            _ => None,
        };
        tracing::warn!(
            "[Workflow:{}] step '{}' failed: {}",
            self.shared.execution_id,
            qid,
            error
        );
        self.shared.events.emit(WorkflowEvent::StepFailed {
            execution_id: self.exec_id(),
            step_id: qid.to_string(),
            error: error.clone(),
            fallback,
        });

        match step.on_error {
            ErrorPolicy::Fail => Err(Abort::Failed {
                step: qid.to_string(),
                error,
            }),
            _ => Ok(StepStatus::Failed),
        }
    }

    fn execute(
        self,
        step: WorkflowStep,
        ctx: ExecutionContext,
        qid: String,
    ) -> BoxFuture<'static, Result<Value, StepFailure>> {
        Box::pin(async move {
            match (&step.kind, step.timeout_ms) {
                // Tool calls time each attempt; human input has its own wait.
                (StepKind::ToolCall { .. }, _) | (StepKind::HumanInput { .. }, _) | (_, None) => {
                    self.execute_kind(&step, ctx, &qid).await
                }
                (_, Some(ms)) => {
                    match tokio::time::timeout(
                        Duration::from_millis(ms),
                        self.execute_kind(&step, ctx, &qid),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(StepFailure::Error(format!("Step timed out after {}ms", ms))),
                    }
                }
            }
        })
    }

    async fn execute_kind(
        &self,
        step: &WorkflowStep,
        ctx: ExecutionContext,
        qid: &str,
    ) -> Result<Value, StepFailure> {
        match &step.kind {
            StepKind::ToolCall {
                provider,
                tool,
                arguments,
            } => {
                let map = ctx.to_map();
                let provider = render_text(provider, &map)?;
                let tool = render_text(tool, &map)?;
                let arguments = match render_value(arguments, &map)? {
                    Value::Null => json!({}),
                    other => other,
                };
                self.call_with_retry(step, qid, &provider, &tool, arguments)
                    .await
            }
            StepKind::Condition { condition } => {
                Ok(Value::Bool(evaluate_bool(condition, &ctx.to_map())?))
            }
            StepKind::Script { script } => Ok(expr::evaluate_str(script, &ctx.to_map())?),
            StepKind::Delay { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                Ok(Value::Null)
            }
            StepKind::Loop {
                items,
                item_var,
                steps,
            } => {
                let items = match expr::evaluate_str(items, &ctx.to_map())? {
                    Value::Array(items) => items,
                    other => {
                        return Err(StepFailure::Error(format!(
                            "loop items must evaluate to an array, got {}",
                            type_name(&other)
                        )))
                    }
                };
                let mut iterations = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let mut child = nested_scope(
                        &ctx,
                        steps,
                        [(item_var.clone(), item), ("index".to_string(), json!(index))],
                    );
                    let prefix = format!("{}[{}]", qid, index);
                    self.run_list(steps, &mut child, self.shared.parallel, Some(&prefix))
                        .await
                        .map_err(nested_failure)?;
                    iterations.push(Value::Object(collect_results(&child, steps)));
                }
                Ok(Value::Array(iterations))
            }
            StepKind::Parallel { steps } => {
                let mut child = nested_scope(&ctx, steps, std::iter::empty());
                self.run_list(steps, &mut child, true, Some(qid))
                    .await
                    .map_err(nested_failure)?;
                Ok(Value::Object(collect_results(&child, steps)))
            }
            StepKind::HumanInput { prompt, schema } => {
                let prompt = render_text(prompt, &ctx.to_map())?;
                self.await_human_input(step, qid, prompt, schema.clone())
                    .await
            }
        }
    }

    async fn call_with_retry(
        &self,
        step: &WorkflowStep,
        qid: &str,
        provider: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, StepFailure> {
        let policy = step.retry.clone().unwrap_or(RetryPolicy {
            max_retries: 0,
            retry_delay_ms: 0,
            backoff_multiplier: 1.0,
        });
        let mut attempt: u32 = 1;
        loop {
            let call = self.shared.invoker.invoke(
                tool,
                provider,
                arguments.clone(),
                &self.shared.execution_id,
            );
            let result = match step.timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("Tool call timed out after {}ms", ms)),
                },
                None => call.await.map_err(|e| e.to_string()),
            };
            let error = match result {
                Ok(value) => match tool_error_text(&value) {
                    None => return Ok(value),
                    Some(error) => error,
                },
                Err(error) => error,
            };

            if attempt > policy.max_retries {
                return Err(StepFailure::Error(error));
            }
            if self.halted() {
                return Err(StepFailure::Abort(Abort::Cancelled));
            }
            let delay = policy.delay_after(attempt);
            tracing::debug!(
                "[Workflow:{}] retrying '{}' (attempt {}) in {:?}: {}",
                self.shared.execution_id,
                qid,
                attempt,
                delay,
                error
            );
            self.shared.events.emit(WorkflowEvent::StepRetrying {
                execution_id: self.exec_id(),
                step_id: qid.to_string(),
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error,
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn await_human_input(
        &self,
        step: &WorkflowStep,
        qid: &str,
        prompt: String,
        schema: Option<Value>,
    ) -> Result<Value, StepFailure> {
        let key = (self.exec_id(), qid.to_string());
        let (tx, rx) = oneshot::channel();
        self.shared
            .human
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone(), tx);
        self.shared.events.emit(WorkflowEvent::HumanInputRequired {
            execution_id: self.exec_id(),
            step_id: qid.to_string(),
            prompt,
            schema,
        });

        let wait = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.shared.human_input_timeout);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(StepFailure::Abort(Abort::Cancelled)),
            Err(_) => {
                self.shared
                    .human
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&key);
                Err(StepFailure::Error(format!(
                    "Timed out waiting for human input after {}ms",
                    wait.as_millis()
                )))
            }
        }
    }
}

fn qualify(scope: Option<&str>, id: &str) -> String {
    match scope {
        Some(prefix) => format!("{}.{}", prefix, id),
        None => id.to_string(),
    }
}

/// `Ok(Some(reason))` when the step should be skipped.
fn gate(step: &WorkflowStep, ctx: &Map<String, Value>) -> Result<Option<String>, String> {
    if let Some(when) = &step.when {
        if !evaluate_bool(when, ctx).map_err(|e| format!("when: {}", e))? {
            return Ok(Some(format!("when condition '{}' is false", when)));
        }
    }
    if let Some(unless) = &step.unless {
        if evaluate_bool(unless, ctx).map_err(|e| format!("unless: {}", e))? {
            return Ok(Some(format!("unless condition '{}' is true", unless)));
        }
    }
    Ok(None)
}

/// Providers signal tool-level failure with `isError: true`.
fn tool_error_text(result: &Value) -> Option<String> {
    if result.get("isError").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.iter().find_map(|c| c.get("text").and_then(Value::as_str)))
        .unwrap_or("tool reported an error");
    Some(text.to_string())
}

/// Child context for a nested list, with the nested ids cleared so outer
/// steps of the same name do not leak into the body's results.
fn nested_scope<I>(ctx: &ExecutionContext, steps: &[WorkflowStep], locals: I) -> ExecutionContext
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut child = ctx.with_locals(locals);
    for step in steps {
        child.steps.remove(&step.id);
        child.status.remove(&step.id);
        child.errors.remove(&step.id);
    }
    child
}

fn collect_results(child: &ExecutionContext, steps: &[WorkflowStep]) -> Map<String, Value> {
    steps
        .iter()
        .filter_map(|s| child.steps.get(&s.id).map(|v| (s.id.clone(), v.clone())))
        .collect()
}

/// A body that failed under the `fail` policy fails its parent step; cancel
/// and timeout stop the whole execution.
fn nested_failure(abort: Abort) -> StepFailure {
    match abort {
        Abort::Failed { step, error } => {
            StepFailure::Error(format!("step '{}' failed: {}", step, error))
        }
        other => StepFailure::Abort(other),
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(yaml: &str) -> WorkflowStep {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify(None, "a"), "a");
        assert_eq!(qualify(Some("each[2]"), "read"), "each[2].read");
    }

    #[test]
    fn test_gate() {
        let Value::Object(ctx) = json!({ "inputs": { "go": false, "n": 3 } }) else {
            unreachable!()
        };
        let when = step("id: a\ntype: delay\nduration_ms: 1\nwhen: inputs.go\n");
        assert!(gate(&when, &ctx).unwrap().is_some());

        let unless = step("id: a\ntype: delay\nduration_ms: 1\nunless: inputs.n > 5\n");
        assert_eq!(gate(&unless, &ctx).unwrap(), None);

        let broken = step("id: a\ntype: delay\nduration_ms: 1\nwhen: missing.value\n");
        assert!(gate(&broken, &ctx).is_err());
    }

    #[test]
    fn test_tool_error_text() {
        assert_eq!(tool_error_text(&json!({ "content": [] })), None);
        assert_eq!(
            tool_error_text(&json!({
                "isError": true,
                "content": [{ "type": "text", "text": "no such file" }]
            })),
            Some("no such file".to_string())
        );
        assert_eq!(
            tool_error_text(&json!({ "isError": true })),
            Some("tool reported an error".to_string())
        );
    }

    #[test]
    fn test_nested_scope_hides_outer_results() {
        let mut ctx = ExecutionContext::default();
        ctx.record_result("read", json!("outer"));
        ctx.record_result("other", json!(1));
        let body = vec![step("id: read\ntype: delay\nduration_ms: 1\n")];

        let child = nested_scope(&ctx, &body, [("item".to_string(), json!("x"))]);
        assert!(!child.steps.contains_key("read"));
        assert_eq!(child.steps["other"], 1);
        assert!(collect_results(&child, &body).is_empty());
    }

    #[test]
    fn test_nested_failure_mapping() {
        assert!(matches!(
            nested_failure(Abort::Failed {
                step: "x".into(),
                error: "boom".into()
            }),
            StepFailure::Error(ref e) if e.contains("boom")
        ));
        assert!(matches!(
            nested_failure(Abort::Cancelled),
            StepFailure::Abort(Abort::Cancelled)
        ));
    }
}
