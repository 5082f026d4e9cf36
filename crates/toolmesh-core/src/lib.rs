//! Toolmesh Core: drives a fleet of tool provider subprocesses over
//! line-delimited JSON-RPC and composes their tools into workflows.
//!
//! Three components, leaf first:
//!
//! - [`ProtocolClient`] spawns each provider, performs the handshake and
//!   correlates requests with responses.
//! - [`ConnectionManager`] supervises provider status, capacity, health
//!   checks and backoff reconnection on top of a client.
//! - [`WorkflowEngine`] runs dependency-ordered step graphs against the
//!   manager through the [`ToolInvoker`] seam.
//!
//! Each component is an explicitly constructed, cheaply cloneable handle with
//! its own typed event channel and an explicit `shutdown()`.

pub mod analytics;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod protocol;
pub mod rpc;
pub mod security;
pub mod workflow;

// Convenience re-exports
pub use config::{ConfigError, ToolmeshConfig};
pub use error::{ClientError, ManagerError, WorkflowError};
pub use events::{ClientEvent, ManagerEvent, WorkflowEvent};
pub use manager::{ConnectionManager, ConnectionStatus, ManagerConfig, ProviderStatus};
pub use models::{ProviderConfig, ProviderTool, Tool};
pub use protocol::{ClientConfig, ExitReason, ProtocolClient};
pub use workflow::{
    EngineConfig, ExecutionStatus, ToolInvoker, WorkflowDefinition, WorkflowEngine,
    WorkflowExecution,
};
