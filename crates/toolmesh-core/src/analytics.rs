//! Analytics collaborator fed after every connect attempt and tool call,
//! whatever the outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub provider: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub provider: String,
    pub tool: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_connection_event(&self, event: ConnectionEvent);

    async fn record_tool_call_event(&self, event: ToolCallEvent);
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAnalytics;

#[async_trait]
impl AnalyticsSink for TracingAnalytics {
    async fn record_connection_event(&self, event: ConnectionEvent) {
        tracing::debug!(
            provider = %event.provider,
            success = event.success,
            duration_ms = event.duration_ms,
            error = event.error.as_deref().unwrap_or(""),
            "[Analytics] connection"
        );
    }

    async fn record_tool_call_event(&self, event: ToolCallEvent) {
        tracing::debug!(
            provider = %event.provider,
            tool = %event.tool,
            success = event.success,
            duration_ms = event.duration_ms,
            error = event.error.as_deref().unwrap_or(""),
            "[Analytics] tool call"
        );
    }
}
