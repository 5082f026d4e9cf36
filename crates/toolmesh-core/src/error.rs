//! Error types for each layer of the core.
//!
//! Lower layers report raw failures; only the workflow engine decides whether
//! a failure is fatal to an execution.

use crate::workflow::expr::ExprError;

/// Failures raised by the protocol client and its transport connections.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("Provider '{0}' is already registered")]
    ProviderExists(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider '{0}' is not connected")]
    NotConnected(String),

    #[error("Failed to spawn provider '{provider}': {message}")]
    Spawn { provider: String, message: String },

    #[error("Handshake with provider '{provider}' failed: {message}")]
    Handshake { provider: String, message: String },

    #[error("Timeout waiting for {method} (id={id}, {timeout_ms}ms)")]
    Timeout {
        method: String,
        id: u64,
        timeout_ms: u64,
    },

    #[error("Remote error [{code}]: {message}")]
    Remote { code: i64, message: String },

    #[error("Write {method}: {message}")]
    Write { method: String, message: String },

    #[error("Connection to '{0}' closed")]
    Closed(String),

    #[error("Connection to '{provider}' failed after {attempts} attempt(s): {cause}")]
    ConnectionFailed {
        provider: String,
        attempts: u32,
        cause: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Failures raised by the connection manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagerError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider '{0}' is already registered")]
    ProviderExists(String),

    #[error("Provider '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("Connection limit reached ({max} concurrent connections)")]
    CapacityExceeded { max: usize },

    #[error("Provider '{0}' is not connected")]
    NotConnected(String),

    #[error("Tool '{tool}' is not available on provider '{provider}'")]
    UnknownTool { tool: String, provider: String },

    #[error("Blocked by security policy: {0}")]
    SecurityDenied(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Failures raised by workflow registration and execution control.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to parse workflow: {0}")]
    Parse(String),

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{step}' names unknown fallback step '{fallback}'")]
    UnknownFallback { step: String, fallback: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Workflow '{0}' is already registered")]
    WorkflowExists(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Unknown execution: {0}")]
    UnknownExecution(String),

    #[error("Execution '{execution}' cannot {action} while {status}")]
    InvalidState {
        execution: String,
        action: String,
        status: String,
    },

    #[error("Concurrent execution limit reached ({max})")]
    ConcurrencyLimit { max: usize },

    #[error("Missing required input '{0}'")]
    MissingInput(String),

    #[error("No pending input for step '{step}' of execution '{execution}'")]
    NoPendingInput { execution: String, step: String },

    #[error("Step '{step}' has an invalid expression: {message}")]
    InvalidExpression { step: String, message: String },

    #[error("Workflow engine is shutting down")]
    ShuttingDown,

    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),
}
