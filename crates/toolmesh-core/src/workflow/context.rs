//! Step execution context: the values expressions and templates can see.

use serde_json::{Map, Value};

use super::execution::StepStatus;

/// Variables visible while a step list runs.
///
/// Each nested list (loop iteration, parallel body) gets its own clone with
/// extra locals bound, so sibling iterations never see each other's results.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub inputs: Map<String, Value>,
    pub variables: Map<String, Value>,
    /// Step id → result
    pub steps: Map<String, Value>,
    /// Step id → terminal status
    pub status: Map<String, Value>,
    /// Step id → error message
    pub errors: Map<String, Value>,
    /// Loop item variable, `index` and any other scope-local bindings
    pub locals: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(inputs: Map<String, Value>, variables: Map<String, Value>) -> Self {
        Self {
            inputs,
            variables,
            ..Default::default()
        }
    }

    /// Flatten into the map expressions are evaluated against.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("inputs".into(), Value::Object(self.inputs.clone()));
        map.insert("variables".into(), Value::Object(self.variables.clone()));
        map.insert("steps".into(), Value::Object(self.steps.clone()));
        map.insert("status".into(), Value::Object(self.status.clone()));
        map.insert("errors".into(), Value::Object(self.errors.clone()));
        for (key, value) in &self.locals {
            map.insert(key.clone(), value.clone());
        }
        map
    }

    /// Child scope for a nested step list. Results recorded in the child stay
    /// in the child.
    pub fn with_locals<I>(&self, locals: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut child = self.clone();
        child.locals.extend(locals);
        child
    }

    pub fn record_result(&mut self, step_id: &str, result: Value) {
        self.steps.insert(step_id.to_string(), result);
    }

    pub fn record_status(&mut self, step_id: &str, status: StepStatus) {
        self.status
            .insert(step_id.to_string(), Value::String(status.as_str().to_string()));
    }

    pub fn record_error(&mut self, step_id: &str, error: &str) {
        self.errors
            .insert(step_id.to_string(), Value::String(error.to_string()));
    }
}
