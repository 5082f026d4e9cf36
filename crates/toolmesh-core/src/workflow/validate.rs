//! Definition checks run once at registration.
//!
//! Every step list (top level and each nested `loop`/`parallel` body) is
//! checked on its own: ids unique, dependencies and fallbacks resolvable,
//! no dependency cycle, every expression parseable.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::WorkflowError;

use super::expr::{parse, strip_template};
use super::schema::{ErrorPolicy, StepKind, WorkflowDefinition, WorkflowStep};
use super::template::{placeholders, value_placeholders};

/// Validate `def` and return its top-level step ids in execution order.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<Vec<String>, WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::Parse("workflow id must not be empty".into()));
    }

    let mut inputs = HashSet::new();
    for input in &def.inputs {
        if !inputs.insert(input.name.as_str()) {
            return Err(WorkflowError::Parse(format!(
                "duplicate input '{}'",
                input.name
            )));
        }
    }

    validate_steps(&def.steps)?;

    for (name, source) in &def.outputs {
        parse(strip_template(source)).map_err(|e| WorkflowError::InvalidExpression {
            step: format!("outputs.{}", name),
            message: e.to_string(),
        })?;
    }

    let order = topological_order(&def.steps)?;
    Ok(order.into_iter().map(|i| def.steps[i].id.clone()).collect())
}

/// Check one step list and recurse into nested bodies.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    let mut ids = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::Parse("step id must not be empty".into()));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(WorkflowError::DuplicateStep(step.id.clone()));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        if let ErrorPolicy::Fallback(fallback) = &step.on_error {
            if !ids.contains(fallback.as_str()) {
                return Err(WorkflowError::UnknownFallback {
                    step: step.id.clone(),
                    fallback: fallback.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(steps) {
        return Err(WorkflowError::Cycle(cycle));
    }

    for step in steps {
        check_expressions(step)?;
        if let Some(nested) = step.kind.nested_steps() {
            validate_steps(nested)?;
        }
    }
    Ok(())
}

/// Depth-first search over `depends_on` edges. Returns the ids along the
/// first cycle found, closed with the starting id.
pub fn find_cycle(steps: &[WorkflowStep]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut path: Vec<usize> = Vec::new();

    fn visit(
        node: usize,
        steps: &[WorkflowStep],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        path.push(node);
        for dep in &steps[node].depends_on {
            let Some(&next) = index.get(dep.as_str()) else {
                continue;
            };
            match marks[next] {
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&n| steps[n].id.clone()).collect();
                    cycle.push(steps[next].id.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, steps, index, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    for start in 0..steps.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, steps, &index, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Kahn's algorithm over one step list. Ties go to declaration order, so a
/// list without dependencies runs exactly as written.
pub fn topological_order(steps: &[WorkflowStep]) -> Result<Vec<usize>, WorkflowError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        let deps: BTreeSet<usize> = step
            .depends_on
            .iter()
            .filter_map(|d| index.get(d.as_str()).copied())
            .collect();
        indegree[i] = deps.len();
        for dep in deps {
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < steps.len() {
        let cycle = find_cycle(steps).unwrap_or_else(|| {
            (0..steps.len())
                .filter(|i| !order.contains(i))
                .map(|i| steps[i].id.clone())
                .collect()
        });
        return Err(WorkflowError::Cycle(cycle));
    }
    Ok(order)
}

fn check_expressions(step: &WorkflowStep) -> Result<(), WorkflowError> {
    let invalid = |e: super::expr::ExprError| WorkflowError::InvalidExpression {
        step: step.id.clone(),
        message: e.to_string(),
    };
    let expression = |source: &str| parse(strip_template(source)).map(|_| ()).map_err(invalid);
    let template = |source: &str| -> Result<(), WorkflowError> {
        for inner in placeholders(source).map_err(invalid)? {
            parse(inner).map_err(invalid)?;
        }
        Ok(())
    };

    if let Some(when) = &step.when {
        expression(when)?;
    }
    if let Some(unless) = &step.unless {
        expression(unless)?;
    }

    match &step.kind {
        StepKind::ToolCall {
            provider,
            tool,
            arguments,
        } => {
            template(provider)?;
            template(tool)?;
            for inner in value_placeholders(arguments).map_err(invalid)? {
                parse(&inner).map_err(invalid)?;
            }
        }
        StepKind::Condition { condition } => expression(condition)?,
        StepKind::Loop { items, item_var, .. } => {
            expression(items)?;
            if item_var.trim().is_empty() || item_var == "index" {
                return Err(WorkflowError::InvalidExpression {
                    step: step.id.clone(),
                    message: format!("'{}' cannot be used as a loop item variable", item_var),
                });
            }
        }
        StepKind::Script { script } => expression(script)?,
        StepKind::HumanInput { prompt, .. } => template(prompt)?,
        StepKind::Parallel { .. } | StepKind::Delay { .. } => {}
    }
    Ok(())
}
