//! The single capability the workflow engine needs from the outside world.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ManagerError;
use crate::manager::ConnectionManager;
use crate::security::SecurityContext;

/// Invokes a tool on a provider on behalf of a workflow execution.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        tool: &str,
        provider: &str,
        arguments: Value,
        execution_id: &str,
    ) -> Result<Value, ManagerError>;
}

#[async_trait]
impl ToolInvoker for ConnectionManager {
    async fn invoke(
        &self,
        tool: &str,
        provider: &str,
        arguments: Value,
        execution_id: &str,
    ) -> Result<Value, ManagerError> {
        let ctx = SecurityContext {
            provider: provider.to_string(),
            execution_id: Some(execution_id.to_string()),
            arguments: Some(arguments.clone()),
        };
        self.call_tool_with_context(tool, provider, arguments, ctx)
            .await
    }
}
