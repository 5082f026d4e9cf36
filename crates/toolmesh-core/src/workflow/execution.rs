//! Execution records published while a workflow runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Snapshot of one workflow run. Only top-level steps appear in the step
/// lists; nested results live inside their parent's result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub inputs: Map<String, Value>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub results: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, String>,
    pub outputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(execution_id: String, workflow_id: String, inputs: Map<String, Value>) -> Self {
        Self {
            execution_id,
            workflow_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            inputs,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            outputs: Map::new(),
            error: None,
        }
    }

    /// Terminal status of a top-level step, if it has one.
    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        let has = |list: &[String]| list.iter().any(|s| s == step_id);
        if has(&self.completed_steps) {
            Some(StepStatus::Completed)
        } else if has(&self.failed_steps) {
            Some(StepStatus::Failed)
        } else if has(&self.skipped_steps) {
            Some(StepStatus::Skipped)
        } else {
            None
        }
    }

    /// Record a terminal step outcome. A step is counted at most once; later
    /// records for the same id are ignored.
    pub fn record(&mut self, step_id: &str, status: StepStatus, result: Option<Value>, error: Option<&str>) {
        if self.step_status(step_id).is_some() {
            return;
        }
        let list = match status {
            StepStatus::Completed => &mut self.completed_steps,
            StepStatus::Failed => &mut self.failed_steps,
            StepStatus::Skipped => &mut self.skipped_steps,
            StepStatus::Pending | StepStatus::Running => return,
        };
        list.push(step_id.to_string());
        if let Some(result) = result {
            self.results.insert(step_id.to_string(), result);
        }
        if let Some(error) = error {
            self.errors.insert(step_id.to_string(), error.to_string());
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
