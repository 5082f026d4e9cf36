use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::models::{ProviderConfig, Tool};
use crate::protocol::ProtocolClient;

/// What a successful connect reports back to the manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOutcome {
    pub tools: Vec<Tool>,
    pub capabilities: Option<Value>,
}

/// The transport the connection manager supervises.
///
/// [`ProtocolClient`] is the production implementation; tests plug in fakes.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    async fn connect(&self, config: &ProviderConfig) -> Result<ConnectOutcome, ClientError>;

    async fn disconnect(&self, provider: &str) -> Result<(), ClientError>;

    /// Live tool-list query, used by health checks.
    async fn list_tools(&self, provider: &str) -> Result<Vec<Tool>, ClientError>;

    async fn call_tool(&self, tool: &str, provider: &str, arguments: Value) -> Result<Value, ClientError>;

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;

    async fn shutdown(&self);
}

#[async_trait]
impl ProviderBackend for ProtocolClient {
    async fn connect(&self, config: &ProviderConfig) -> Result<ConnectOutcome, ClientError> {
        let tools = self.add_provider(config.clone()).await?;
        Ok(ConnectOutcome {
            tools,
            capabilities: self.capabilities(&config.name).await,
        })
    }

    async fn disconnect(&self, provider: &str) -> Result<(), ClientError> {
        self.remove_provider(provider).await
    }

    async fn list_tools(&self, provider: &str) -> Result<Vec<Tool>, ClientError> {
        self.fetch_tools(provider).await
    }

    async fn call_tool(&self, tool: &str, provider: &str, arguments: Value) -> Result<Value, ClientError> {
        ProtocolClient::call_tool(self, tool, provider, arguments).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        ProtocolClient::subscribe(self)
    }

    async fn shutdown(&self) {
        ProtocolClient::shutdown(self).await
    }
}
