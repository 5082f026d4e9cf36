//! Workflow definition types, loadable from YAML or JSON.
//!
//! ```yaml
//! id: summarize-repo
//! name: "Summarize repository"
//! version: "1.0"
//!
//! inputs:
//!   - name: path
//!     required: true
//!
//! variables:
//!   max_lines: 40
//!
//! parallel: true
//! timeout_ms: 120000
//!
//! steps:
//!   - id: list
//!     type: tool_call
//!     provider: fs
//!     tool: list_files
//!     arguments:
//!       path: "${inputs.path}"
//!     retry:
//!       max_retries: 2
//!       retry_delay_ms: 500
//!
//!   - id: read_each
//!     type: loop
//!     depends_on: [list]
//!     items: "steps.list.files"
//!     steps:
//!       - id: read
//!         type: tool_call
//!         provider: fs
//!         tool: read_file
//!         arguments:
//!           path: "${item}"
//!           limit: "${variables.max_lines}"
//!
//!   - id: notify
//!     type: tool_call
//!     depends_on: [read_each]
//!     unless: "len(steps.read_each) == 0"
//!     provider: chat
//!     tool: post
//!     on_error: continue
//!
//! outputs:
//!   files: "len(steps.read_each)"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WorkflowError;

/// Top-level workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Registry key
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Declared inputs, checked when an execution starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<WorkflowInput>,

    /// Static values exposed as `variables.*`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,

    pub steps: Vec<WorkflowStep>,

    /// Dispatch every ready step at once instead of one at a time
    #[serde(default)]
    pub parallel: bool,

    /// Overall execution timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Output name → expression evaluated against the final context
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub name: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within its step list
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: StepKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Run only if this predicate is truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Skip if this predicate is truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless: Option<String>,

    /// Only honoured by `tool_call` steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub on_error: ErrorPolicy,
}

impl WorkflowStep {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    ToolCall {
        provider: String,
        tool: String,
        /// JSON template; strings may contain `${expr}` placeholders
        #[serde(default, skip_serializing_if = "Value::is_null")]
        arguments: Value,
    },
    Condition {
        condition: String,
    },
    Loop {
        /// Expression producing an array
        items: String,
        #[serde(default = "default_item_var")]
        item_var: String,
        steps: Vec<WorkflowStep>,
    },
    Parallel {
        steps: Vec<WorkflowStep>,
    },
    Delay {
        duration_ms: u64,
    },
    Script {
        script: String,
    },
    HumanInput {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
}

fn default_item_var() -> String {
    "item".to_string()
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::ToolCall { .. } => "tool_call",
            StepKind::Condition { .. } => "condition",
            StepKind::Loop { .. } => "loop",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Delay { .. } => "delay",
            StepKind::Script { .. } => "script",
            StepKind::HumanInput { .. } => "human_input",
        }
    }

    /// Nested step list for `loop` and `parallel`.
    pub fn nested_steps(&self) -> Option<&[WorkflowStep]> {
        match self {
            StepKind::Loop { steps, .. } | StepKind::Parallel { steps } => Some(steps),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

/// Without a multiplier the delay stays constant.
fn default_backoff_multiplier() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.backoff_multiplier.max(0.0).powi(exponent.min(i32::MAX as u32) as i32);
        let millis = (self.retry_delay_ms as f64 * factor).min(u64::MAX as f64);
        std::time::Duration::from_millis(millis as u64)
    }
}

/// What happens when a step fails.
///
/// Written as `fail`, `continue`, `skip` or `{ fallback: <step id> }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ErrorPolicyRepr", into = "ErrorPolicyRepr")]
pub enum ErrorPolicy {
    /// Abort the execution (default)
    #[default]
    Fail,
    /// Record the failure and keep going
    Continue,
    /// Record the step as skipped
    Skip,
    /// Record the failure and name the step that handles it
    Fallback(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ErrorPolicyRepr {
    Name(String),
    Fallback { fallback: String },
}

impl TryFrom<ErrorPolicyRepr> for ErrorPolicy {
    type Error = String;

    fn try_from(repr: ErrorPolicyRepr) -> Result<Self, Self::Error> {
        match repr {
            ErrorPolicyRepr::Name(name) => match name.as_str() {
                "fail" => Ok(ErrorPolicy::Fail),
                "continue" => Ok(ErrorPolicy::Continue),
                "skip" => Ok(ErrorPolicy::Skip),
                other => Err(format!(
                    "unknown on_error policy '{}' (expected fail, continue, skip or {{ fallback: <id> }})",
                    other
                )),
            },
            ErrorPolicyRepr::Fallback { fallback } => Ok(ErrorPolicy::Fallback(fallback)),
        }
    }
}

impl From<ErrorPolicy> for ErrorPolicyRepr {
    fn from(policy: ErrorPolicy) -> Self {
        match policy {
            ErrorPolicy::Fail => ErrorPolicyRepr::Name("fail".into()),
            ErrorPolicy::Continue => ErrorPolicyRepr::Name("continue".into()),
            ErrorPolicy::Skip => ErrorPolicyRepr::Name("skip".into()),
            ErrorPolicy::Fallback(fallback) => ErrorPolicyRepr::Fallback { fallback },
        }
    }
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WorkflowError::Parse(format!("invalid workflow YAML: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        serde_json::from_str(json)
            .map_err(|e| WorkflowError::Parse(format!("invalid workflow JSON: {}", e)))
    }

    /// Load a definition, choosing the format by extension (`.json`, else YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Parse(format!("failed to read '{}': {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}
