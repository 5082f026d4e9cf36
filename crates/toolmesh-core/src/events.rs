//! Typed event channels.
//!
//! Each component owns one [`EventChannel`] for its own event category.
//! Consumers call `subscribe()` and poll the receiver; `close()` drops the
//! sender so every receiver observes `RecvError::Closed` on shutdown.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::manager::ProviderStatus;
use crate::models::Tool;
use crate::protocol::ExitReason;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A closable broadcast channel for one event category.
pub struct EventChannel<T> {
    tx: Arc<RwLock<Option<broadcast::Sender<T>>>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: Arc::new(RwLock::new(Some(tx))),
        }
    }

    /// Publish to current subscribers. Events with no subscriber are dropped.
    pub fn emit(&self, event: T) {
        if let Some(tx) = self.read().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to future events. After `close()` the receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        match self.read().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    pub fn close(&self) {
        self.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.read().is_none()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<broadcast::Sender<T>>> {
        self.tx.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<broadcast::Sender<T>>> {
        self.tx.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone + Send + 'static> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

// ─── Protocol client events ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientErrorKind {
    /// Initial connect gave up after exhausting its retries.
    ConnectionFailed,
    /// A restart after an unexpected exit failed.
    RestartFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected {
        provider: String,
        tools: Vec<Tool>,
    },
    Reconnecting {
        provider: String,
        attempt: u32,
        delay_ms: u64,
    },
    Disconnected {
        provider: String,
        reason: ExitReason,
    },
    Error {
        provider: String,
        kind: ClientErrorKind,
        message: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Disconnected { .. } => "disconnected",
            Self::Error { .. } => "error",
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Connected { provider, .. }
            | Self::Reconnecting { provider, .. }
            | Self::Disconnected { provider, .. }
            | Self::Error { provider, .. } => provider,
        }
    }
}

// ─── Connection manager events ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    Status {
        provider: String,
        status: ProviderStatus,
        previous: Option<ProviderStatus>,
        tools_changed: bool,
    },
    ServerConnected {
        provider: String,
        tools: Vec<Tool>,
    },
    ServerDisconnected {
        provider: String,
        unexpected: bool,
    },
    Error {
        provider: String,
        message: String,
    },
}

impl ManagerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::ServerConnected { .. } => "server_connected",
            Self::ServerDisconnected { .. } => "server_disconnected",
            Self::Error { .. } => "error",
        }
    }
}

// ─── Workflow events ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
    },
    StepRetrying {
        execution_id: String,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        result: Value,
    },
    StepFailed {
        execution_id: String,
        step_id: String,
        error: String,
        fallback: Option<String>,
    },
    StepSkipped {
        execution_id: String,
        step_id: String,
        reason: String,
    },
    HumanInputRequired {
        execution_id: String,
        step_id: String,
        prompt: String,
        schema: Option<Value>,
    },
    ExecutionPaused {
        execution_id: String,
    },
    ExecutionResumed {
        execution_id: String,
    },
    ExecutionCompleted {
        execution_id: String,
        workflow_id: String,
    },
    ExecutionFailed {
        execution_id: String,
        workflow_id: String,
        error: String,
    },
    ExecutionCancelled {
        execution_id: String,
        workflow_id: String,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::HumanInputRequired { .. } => "human_input_required",
            Self::ExecutionPaused { .. } => "execution_paused",
            Self::ExecutionResumed { .. } => "execution_resumed",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepRetrying { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::HumanInputRequired { execution_id, .. }
            | Self::ExecutionPaused { execution_id }
            | Self::ExecutionResumed { execution_id }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id, .. } => execution_id,
        }
    }
}
