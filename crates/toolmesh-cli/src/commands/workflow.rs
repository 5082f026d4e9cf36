//! `toolmesh workflow`: Run or validate YAML/JSON workflow files.

use std::sync::Arc;

use console::style;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use toolmesh_core::workflow::validate_definition;
use toolmesh_core::{
    ExecutionStatus, ToolmeshConfig, WorkflowDefinition, WorkflowEngine, WorkflowEvent,
    WorkflowExecution,
};

use super::{print_json, Session};

/// Run a workflow file against the configured providers.
///
/// `human_input` steps are answered interactively unless `interactive` is
/// off, in which case they wait for their timeout.
pub async fn run(
    config: &ToolmeshConfig,
    workflow_file: &str,
    inputs: &[String],
    interactive: bool,
    verbose: bool,
) -> Result<(), String> {
    let workflow = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    let inputs = super::parse_inputs(inputs)?;

    println!(
        "📄 Loaded workflow: {} ({})",
        workflow.display_name(),
        workflow_file
    );
    println!(
        "   {} step(s), {}",
        workflow.steps.len(),
        if workflow.parallel { "parallel" } else { "sequential" }
    );
    println!();

    let session = Session::open(config).await;
    let engine = WorkflowEngine::new(config.engine.clone(), Arc::new(session.manager.clone()));
    let result = execute(&engine, workflow, inputs, interactive, verbose).await;
    engine.shutdown().await;
    session.close().await;

    let execution = result?;
    report(&execution);
    match execution.status {
        ExecutionStatus::Completed => {
            println!("\n🎉 Workflow completed successfully!");
            Ok(())
        }
        status => Err(format!(
            "Workflow {}: {}",
            status,
            execution.error.as_deref().unwrap_or("no error recorded")
        )),
    }
}

async fn execute(
    engine: &WorkflowEngine,
    workflow: WorkflowDefinition,
    inputs: serde_json::Map<String, Value>,
    interactive: bool,
    verbose: bool,
) -> Result<WorkflowExecution, String> {
    let workflow_id = workflow.id.clone();
    engine.register_workflow(workflow).map_err(|e| e.to_string())?;

    let mut events = engine.subscribe();
    let handle = engine
        .start_execution(&workflow_id, inputs)
        .map_err(|e| e.to_string())?;
    let execution_id = handle.execution_id().to_string();
    tracing::info!("Started execution {}", execution_id);

    let finished = handle.wait();
    tokio::pin!(finished);
    let mut listening = true;
    loop {
        tokio::select! {
            execution = &mut finished => return Ok(execution),
            event = events.recv(), if listening => match event {
                Ok(event) if event.execution_id() == execution_id => {
                    if let WorkflowEvent::HumanInputRequired { step_id, prompt, schema, .. } = &event {
                        print_event(&event, verbose);
                        if interactive {
                            let answer = ask(prompt.clone(), schema.clone()).await?;
                            if let Err(e) = engine.provide_human_input(&execution_id, step_id, answer) {
                                tracing::warn!("Input for '{}' was not accepted: {}", step_id, e);
                            }
                        }
                    } else {
                        print_event(&event, verbose);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} workflow event(s)", n);
                }
                // Closed only on engine shutdown; the execution still finishes.
                Err(broadcast::error::RecvError::Closed) => listening = false,
            },
        }
    }
}

fn print_event(event: &WorkflowEvent, verbose: bool) {
    match event {
        WorkflowEvent::StepStarted { step_id, .. } => {
            println!("▶ {}", style(step_id).bold());
        }
        WorkflowEvent::StepCompleted { step_id, result, .. } => {
            println!("  {} {}", style("✓").green(), step_id);
            if verbose {
                println!("    {}", result);
            }
        }
        WorkflowEvent::StepRetrying {
            step_id,
            attempt,
            delay_ms,
            error,
            ..
        } => {
            println!(
                "  {} {} attempt {} failed ({}), retrying in {}ms",
                style("↻").yellow(),
                step_id,
                attempt,
                error,
                delay_ms
            );
        }
        WorkflowEvent::StepFailed {
            step_id,
            error,
            fallback,
            ..
        } => {
            println!("  {} {}: {}", style("✗").red(), step_id, error);
            if let Some(fallback) = fallback {
                println!("    falling back to {}", fallback);
            }
        }
        WorkflowEvent::StepSkipped { step_id, reason, .. } => {
            println!("  {} {} ({})", style("-").dim(), step_id, reason);
        }
        WorkflowEvent::HumanInputRequired { step_id, .. } => {
            println!("  {} {} is waiting for input", style("?").cyan(), step_id);
        }
        WorkflowEvent::ExecutionPaused { .. } => println!("{}", style("paused").yellow()),
        WorkflowEvent::ExecutionResumed { .. } => println!("{}", style("resumed").green()),
        _ => {}
    }
}

/// Prompt on the terminal. Answers that parse as JSON keep their type, so
/// `true` or `42` reach the workflow as a bool or number.
async fn ask(prompt: String, schema: Option<Value>) -> Result<Value, String> {
    tokio::task::spawn_blocking(move || {
        let boolean = schema
            .as_ref()
            .and_then(|s| s.get("type"))
            .and_then(Value::as_str)
            == Some("boolean");
        if boolean {
            return dialoguer::Confirm::new()
                .with_prompt(prompt)
                .interact()
                .map(Value::Bool)
                .map_err(|e| e.to_string());
        }
        let answer: String = dialoguer::Input::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .map_err(|e| e.to_string())?;
        Ok(serde_json::from_str(&answer).unwrap_or(Value::String(answer)))
    })
    .await
    .map_err(|e| format!("Input prompt failed: {}", e))?
}

fn report(execution: &WorkflowExecution) {
    println!();
    println!(
        "Execution {} {} in {}ms",
        execution.execution_id,
        execution.status,
        execution.duration_ms().unwrap_or(0)
    );
    println!(
        "   completed: {}, failed: {}, skipped: {}",
        execution.completed_steps.len(),
        execution.failed_steps.len(),
        execution.skipped_steps.len()
    );
    if !execution.outputs.is_empty() {
        println!("Outputs:");
        print_json(&json!(execution.outputs));
    }
}

/// Validate a workflow file without executing it.
pub async fn validate(workflow_file: &str) -> Result<(), String> {
    let workflow = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    let order = validate_definition(&workflow).map_err(|e| e.to_string())?;

    println!("✅ Workflow '{}' is valid", workflow.display_name());
    println!("   Version: {}", workflow.version);
    println!("   Inputs: {}", workflow.inputs.len());
    println!("   Steps: {}", workflow.steps.len());

    for (i, id) in order.iter().enumerate() {
        if let Some(step) = workflow.step(id) {
            let deps = if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(" (after {})", step.depends_on.join(", "))
            };
            println!("   {}. {} [{}]{}", i + 1, id, step.kind.type_name(), deps);
        }
    }

    Ok(())
}
