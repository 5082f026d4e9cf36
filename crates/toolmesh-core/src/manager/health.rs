//! Periodic health checks: re-query each connected provider's tool list and
//! compare it with what the manager has cached.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::Tool;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HealthOutcome {
    Unchanged,
    ToolsChanged {
        added: Vec<String>,
        removed: Vec<String>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub provider: String,
    #[serde(flatten)]
    pub outcome: HealthOutcome,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        !matches!(self.outcome, HealthOutcome::Failed { .. })
    }
}

/// Compare two tool lists. A changed description or schema on a tool with
/// the same name counts as a change but appears in neither name list.
pub fn compare_tools(cached: &[Tool], live: &[Tool]) -> HealthOutcome {
    if cached == live {
        return HealthOutcome::Unchanged;
    }
    let before: HashSet<&str> = cached.iter().map(|t| t.name.as_str()).collect();
    let after: HashSet<&str> = live.iter().map(|t| t.name.as_str()).collect();

    let mut added: Vec<String> = after.difference(&before).map(|s| s.to_string()).collect();
    let mut removed: Vec<String> = before.difference(&after).map(|s| s.to_string()).collect();
    added.sort();
    removed.sort();
    HealthOutcome::ToolsChanged { added, removed }
}
