//! End-to-end workflow scenarios against a scripted tool invoker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use toolmesh_core::error::{ClientError, ManagerError, WorkflowError};
use toolmesh_core::events::WorkflowEvent;
use toolmesh_core::workflow::{EngineConfig, ExecutionStatus, ToolInvoker, WorkflowDefinition, WorkflowEngine};

/// Tool behaviour is chosen by tool name:
/// `ok` echoes its arguments, `fail` always errors, `flaky` errors until
/// `arguments.succeed_on` attempts, `slow` sleeps `arguments.ms`,
/// `error_result` returns an `isError` result.
#[derive(Default)]
struct ScriptedInvoker {
    calls: Mutex<Vec<(String, Value)>>,
    flaky_attempts: AtomicU32,
}

impl ScriptedInvoker {
    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, tool: &str) -> usize {
        self.calls().iter().filter(|(t, _)| t == tool).count()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        tool: &str,
        _provider: &str,
        arguments: Value,
        _execution_id: &str,
    ) -> Result<Value, ManagerError> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), arguments.clone()));
        let boom = || {
            ManagerError::Client(ClientError::Remote {
                code: -32000,
                message: "boom".into(),
            })
        };
        match tool {
            "ok" => Ok(json!({ "args": arguments })),
            "fail" => Err(boom()),
            "flaky" => {
                let attempt = self.flaky_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let succeed_on = arguments["succeed_on"].as_u64().unwrap_or(1) as u32;
                if attempt >= succeed_on {
                    Ok(json!({ "attempt": attempt }))
                } else {
                    Err(boom())
                }
            }
            "slow" => {
                let ms = arguments["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            }
            "error_result" => Ok(json!({
                "isError": true,
                "content": [{ "type": "text", "text": "bad input" }]
            })),
            other => Err(ManagerError::UnknownTool {
                tool: other.to_string(),
                provider: "scripted".into(),
            }),
        }
    }
}

fn setup(config: EngineConfig) -> (WorkflowEngine, Arc<ScriptedInvoker>) {
    let invoker = Arc::new(ScriptedInvoker::default());
    (WorkflowEngine::new(config, invoker.clone()), invoker)
}

fn register(engine: &WorkflowEngine, yaml: &str) -> String {
    let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
    let id = wf.id.clone();
    engine.register_workflow(wf).unwrap();
    id
}

fn inputs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<WorkflowEvent>, mut matches: F) -> WorkflowEvent
where
    F: FnMut(&WorkflowEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for workflow event")
}

fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_fail_policy_stops_dependents() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: stop
steps:
  - id: A
    type: tool_call
    provider: p
    tool: fail
  - id: B
    type: tool_call
    provider: p
    tool: ok
    depends_on: [A]
"#,
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.completed_steps.is_empty());
    assert_eq!(exec.failed_steps, vec!["A"]);
    assert!(exec.error.as_deref().unwrap_or_default().contains("'A'"));
    assert!(exec.errors["A"].contains("boom"));
    assert_eq!(invoker.count("ok"), 0);
}

#[tokio::test]
async fn test_retry_attempts_n_plus_one() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: retry
steps:
  - id: A
    type: tool_call
    provider: p
    tool: fail
    retry:
      max_retries: 2
      retry_delay_ms: 5
"#,
    );
    let mut events = engine.subscribe();
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(invoker.count("fail"), 3);
    let retries: Vec<(u32, u64)> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            WorkflowEvent::StepRetrying { attempt, delay_ms, .. } => Some((attempt, delay_ms)),
            _ => None,
        })
        .collect();
    // No multiplier given: the delay stays constant.
    assert_eq!(retries, vec![(1, 5), (2, 5)]);
}

#[tokio::test]
async fn test_huge_retry_delay_saturates_and_cancels() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: patient
steps:
  - id: A
    type: tool_call
    provider: p
    tool: fail
    retry:
      max_retries: 3
      retry_delay_ms: 18446744073709551615
      backoff_multiplier: 10
"#,
    );
    let mut events = engine.subscribe();
    let handle = engine.start_execution(&id, Map::new()).unwrap();
    match wait_for(&mut events, |e| matches!(e, WorkflowEvent::StepRetrying { .. })).await {
        WorkflowEvent::StepRetrying { attempt, delay_ms, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay_ms, u64::MAX);
        }
        other => panic!("unexpected {other:?}"),
    }

    engine.cancel_execution(handle.execution_id()).unwrap();
    let exec = handle.wait().await;
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(invoker.count("fail"), 1);
}

#[tokio::test]
async fn test_flaky_step_recovers() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: flaky
steps:
  - id: A
    type: tool_call
    provider: p
    tool: flaky
    arguments:
      succeed_on: 3
    retry:
      max_retries: 5
      retry_delay_ms: 1
"#,
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.results["A"], json!({ "attempt": 3 }));
    assert_eq!(invoker.count("flaky"), 3);
}

#[tokio::test]
async fn test_continue_policy_and_gating() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: gating
steps:
  - id: A
    type: tool_call
    provider: p
    tool: fail
    on_error: continue
  - id: recover
    type: tool_call
    provider: p
    tool: ok
    depends_on: [A]
    when: "status.A == 'failed'"
    arguments:
      reason: "${errors.A}"
  - id: happy
    type: tool_call
    provider: p
    tool: ok
    depends_on: [A]
    when: "status.A == 'completed'"
  - id: guarded
    type: script
    script: "1 + 1"
    unless: "true"
"#,
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.failed_steps, vec!["A"]);
    assert_eq!(exec.completed_steps, vec!["recover"]);
    let mut skipped = exec.skipped_steps.clone();
    skipped.sort();
    assert_eq!(skipped, vec!["guarded", "happy"]);
    assert_eq!(invoker.count("ok"), 1);
    let (_, args) = &invoker.calls()[1];
    assert!(args["reason"].as_str().unwrap().contains("boom"));
}

#[tokio::test]
async fn test_skip_and_fallback_policies() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: policies
steps:
  - id: optional
    type: tool_call
    provider: p
    tool: fail
    on_error: skip
  - id: primary
    type: tool_call
    provider: p
    tool: error_result
    on_error:
      fallback: backup
  - id: backup
    type: tool_call
    provider: p
    tool: ok
    depends_on: [primary]
    when: "status.primary == 'failed'"
"#,
    );
    let mut events = engine.subscribe();
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.skipped_steps, vec!["optional"]);
    assert_eq!(exec.failed_steps, vec!["primary"]);
    assert_eq!(exec.completed_steps, vec!["backup"]);
    assert_eq!(exec.errors["primary"], "bad input");

    let fallback = drain(&mut events).into_iter().find_map(|e| match e {
        WorkflowEvent::StepFailed { step_id, fallback, .. } if step_id == "primary" => fallback,
        _ => None,
    });
    assert_eq!(fallback.as_deref(), Some("backup"));
}

#[tokio::test]
async fn test_loop_binds_item_and_index() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: loop
inputs:
  - name: files
    required: true
steps:
  - id: each
    type: loop
    items: inputs.files
    item_var: file
    steps:
      - id: read
        type: tool_call
        provider: p
        tool: ok
        arguments:
          path: "${file}"
          position: "${index}"
      - id: label
        type: script
        depends_on: [read]
        script: "upper(steps.read.args.path)"
outputs:
  count: "len(steps.each)"
  last: "steps.each[-1].label"
"#,
    );
    let exec = engine
        .execute_workflow(&id, inputs(json!({ "files": ["a.rs", "b.rs", "c.rs"] })))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed, "{:?}", exec.error);
    let iterations = exec.results["each"].as_array().unwrap();
    assert_eq!(iterations.len(), 3);
    assert_eq!(iterations[1]["read"]["args"], json!({ "path": "b.rs", "position": 1 }));
    assert_eq!(iterations[2]["label"], "C.RS");
    assert_eq!(exec.outputs["count"], 3);
    assert_eq!(exec.outputs["last"], "C.RS");
    assert_eq!(invoker.count("ok"), 3);
}

#[tokio::test]
async fn test_loop_over_non_array_fails() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: bad-loop
steps:
  - id: each
    type: loop
    items: "'not a list'"
    steps:
      - id: x
        type: script
        script: item
"#,
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.errors["each"].contains("array"));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_step_runs_children_together() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: fanout
steps:
  - id: fan
    type: parallel
    steps:
      - id: left
        type: tool_call
        provider: p
        tool: slow
        arguments: { ms: 100 }
      - id: right
        type: tool_call
        provider: p
        tool: slow
        arguments: { ms: 100 }
"#,
    );
    let started = tokio::time::Instant::now();
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(exec.results["fan"]["left"], json!({ "slept": 100 }));
    assert_eq!(exec.results["fan"]["right"], json!({ "slept": 100 }));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_workflow_respects_dependencies() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: diamond
parallel: true
steps:
  - id: join
    type: tool_call
    provider: p
    tool: ok
    depends_on: [a, b]
  - id: a
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 100 }
  - id: b
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 100 }
"#,
    );
    let started = tokio::time::Instant::now();
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(exec.completed_steps.last().map(String::as_str), Some("join"));
    assert_eq!(invoker.calls().last().unwrap().0, "ok");
}

#[tokio::test(start_paused = true)]
async fn test_sequential_workflow_runs_one_at_a_time() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: sequential
steps:
  - id: a
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 100 }
  - id: b
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 100 }
"#,
    );
    let started = tokio::time::Instant::now();
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();
    assert_eq!(exec.completed_steps, vec!["a", "b"]);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_templates_pass_typed_values() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: templates
variables:
  factor: 3
steps:
  - id: first
    type: tool_call
    provider: p
    tool: ok
    arguments:
      n: 7
  - id: second
    type: tool_call
    provider: p
    tool: ok
    depends_on: [first]
    arguments:
      doubled: "${steps.first.args.n * variables.factor}"
      label: "n=${steps.first.args.n}"
"#,
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    let (_, args) = &invoker.calls()[1];
    assert_eq!(args, &json!({ "doubled": 21, "label": "n=7" }));
}

#[tokio::test]
async fn test_human_input_round_trip() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: approval
inputs:
  - name: change
    default: "bump deps"
steps:
  - id: approve
    type: human_input
    prompt: "Apply '${inputs.change}'?"
    schema:
      type: boolean
  - id: apply
    type: script
    depends_on: [approve]
    script: "steps.approve ? 'applied' : 'rejected'"
"#,
    );
    let mut events = engine.subscribe();
    let handle = engine.start_execution(&id, Map::new()).unwrap();

    let request = wait_for(&mut events, |e| {
        matches!(e, WorkflowEvent::HumanInputRequired { .. })
    })
    .await;
    let WorkflowEvent::HumanInputRequired { execution_id, step_id, prompt, schema } = request else {
        unreachable!()
    };
    assert_eq!(prompt, "Apply 'bump deps'?");
    assert_eq!(schema, Some(json!({ "type": "boolean" })));

    engine
        .provide_human_input(&execution_id, &step_id, json!(true))
        .unwrap();
    assert!(matches!(
        engine.provide_human_input(&execution_id, &step_id, json!(false)),
        Err(WorkflowError::NoPendingInput { .. })
    ));

    let exec = handle.wait().await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.results["apply"], "applied");
}

#[tokio::test(start_paused = true)]
async fn test_human_input_timeout_is_failure() {
    let (engine, _invoker) = setup(EngineConfig {
        human_input_timeout_ms: 1_000,
        ..Default::default()
    });
    let id = register(
        &engine,
        "id: wait\nsteps:\n  - id: ask\n    type: human_input\n    prompt: anyone?\n",
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.errors["ask"].contains("1000ms"));
}

#[tokio::test]
async fn test_cancel_detaches_running_step() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: cancel
steps:
  - id: long
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 60000 }
  - id: after
    type: tool_call
    provider: p
    tool: ok
    depends_on: [long]
"#,
    );
    let mut events = engine.subscribe();
    let handle = engine.start_execution(&id, Map::new()).unwrap();
    wait_for(&mut events, |e| matches!(e, WorkflowEvent::StepStarted { .. })).await;

    engine.cancel_execution(handle.execution_id()).unwrap();
    let exec = handle.wait().await;

    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert!(exec.completed_steps.is_empty());
    assert_eq!(invoker.count("ok"), 0);
    wait_for(&mut events, |e| matches!(e, WorkflowEvent::ExecutionCancelled { .. })).await;
}

#[tokio::test]
async fn test_pause_holds_dispatch_until_resume() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: pausable
steps:
  - id: first
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 50 }
  - id: second
    type: tool_call
    provider: p
    tool: ok
    depends_on: [first]
"#,
    );
    let mut events = engine.subscribe();
    let handle = engine.start_execution(&id, Map::new()).unwrap();
    let exec_id = handle.execution_id().to_string();
    wait_for(&mut events, |e| matches!(e, WorkflowEvent::StepStarted { .. })).await;

    engine.pause_execution(&exec_id).unwrap();
    assert!(matches!(
        engine.pause_execution(&exec_id),
        Err(WorkflowError::InvalidState { .. })
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.execution(&exec_id).unwrap().status, ExecutionStatus::Paused);
    assert_eq!(invoker.count("ok"), 0);

    engine.resume_execution(&exec_id).unwrap();
    let exec = handle.wait().await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.completed_steps, vec!["first", "second"]);

    let names: Vec<&'static str> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert!(names.contains(&"execution_paused"));
    assert!(names.contains(&"execution_resumed"));
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_fails_execution() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: deadline
timeout_ms: 100
steps:
  - id: long
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 10000 }
"#,
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_applies_per_attempt() {
    let (engine, invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        r#"
id: step-timeout
steps:
  - id: long
    type: tool_call
    provider: p
    tool: slow
    arguments: { ms: 1000 }
    timeout_ms: 100
    retry:
      max_retries: 1
      retry_delay_ms: 10
"#,
    );
    let exec = engine.execute_workflow(&id, Map::new()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.errors["long"].contains("timed out"));
    assert_eq!(invoker.count("slow"), 2);
}

#[tokio::test]
async fn test_concurrency_cap() {
    let (engine, _invoker) = setup(EngineConfig {
        max_concurrent_executions: 1,
        ..Default::default()
    });
    let id = register(
        &engine,
        "id: one\nsteps:\n  - id: s\n    type: tool_call\n    provider: p\n    tool: slow\n    arguments: { ms: 100 }\n",
    );
    let first = engine.start_execution(&id, Map::new()).unwrap();
    assert!(matches!(
        engine.start_execution(&id, Map::new()),
        Err(WorkflowError::ConcurrencyLimit { max: 1 })
    ));
    assert_eq!(engine.executions().len(), 1);

    first.wait().await;
    let second = engine.start_execution(&id, Map::new()).unwrap();
    assert_eq!(second.wait().await.status, ExecutionStatus::Completed);
    assert_eq!(engine.executions().len(), 2);
}

#[tokio::test]
async fn test_invalid_definitions_never_register() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let cyclic = WorkflowDefinition::from_yaml(
        r#"
id: cyclic
steps:
  - id: a
    type: script
    script: "1"
    depends_on: [b]
  - id: b
    type: script
    script: "2"
    depends_on: [a]
"#,
    )
    .unwrap();
    assert!(matches!(
        engine.register_workflow(cyclic),
        Err(WorkflowError::Cycle(_))
    ));
    let unknown = WorkflowDefinition::from_yaml(
        "id: unknown\nsteps:\n  - id: a\n    type: script\n    script: \"1\"\n    depends_on: [zzz]\n",
    )
    .unwrap();
    assert!(matches!(
        engine.register_workflow(unknown),
        Err(WorkflowError::UnknownDependency { .. })
    ));
    let deep_script = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
    let deep = WorkflowDefinition::from_json(
        &json!({
            "id": "deep",
            "steps": [{ "id": "a", "type": "script", "script": deep_script }]
        })
        .to_string(),
    )
    .unwrap();
    match engine.register_workflow(deep) {
        Err(WorkflowError::InvalidExpression { step, message }) => {
            assert_eq!(step, "a");
            assert!(message.contains("nested too deeply"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(engine.workflows().is_empty());
}

#[tokio::test]
async fn test_event_sequence() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        "id: events\nsteps:\n  - id: s\n    type: tool_call\n    provider: p\n    tool: ok\n",
    );
    let mut events = engine.subscribe();
    engine.execute_workflow(&id, Map::new()).await.unwrap();

    let names: Vec<&'static str> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec!["execution_started", "step_started", "step_completed", "execution_completed"]
    );
}

#[tokio::test]
async fn test_shutdown_cancels_live_executions() {
    let (engine, _invoker) = setup(EngineConfig::default());
    let id = register(
        &engine,
        "id: long\nsteps:\n  - id: s\n    type: tool_call\n    provider: p\n    tool: slow\n    arguments: { ms: 60000 }\n",
    );
    let mut events = engine.subscribe();
    let handle = engine.start_execution(&id, Map::new()).unwrap();
    wait_for(&mut events, |e| matches!(e, WorkflowEvent::StepStarted { .. })).await;

    engine.shutdown().await;
    assert_eq!(handle.wait().await.status, ExecutionStatus::Cancelled);

    assert!(engine
        .executions()
        .iter()
        .all(|e| e.status == ExecutionStatus::Cancelled));
    assert!(matches!(
        engine.start_execution(&id, Map::new()),
        Err(WorkflowError::ShuttingDown)
    ));
}
