//! Security collaborator consulted before connecting to a provider and
//! before invoking one of its tools.
//!
//! Rule evaluation lives outside the core; the core only asks and obeys.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ProviderConfig, Tool};

/// Who is asking, for policies that care.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

impl SecurityContext {
    pub fn for_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait SecurityValidator: Send + Sync {
    async fn validate_connection(&self, config: &ProviderConfig, ctx: &SecurityContext) -> Verdict;

    async fn validate_tool_call(&self, tool: &Tool, ctx: &SecurityContext) -> Verdict;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl SecurityValidator for AllowAll {
    async fn validate_connection(&self, _config: &ProviderConfig, _ctx: &SecurityContext) -> Verdict {
        Verdict::allow()
    }

    async fn validate_tool_call(&self, _tool: &Tool, _ctx: &SecurityContext) -> Verdict {
        Verdict::allow()
    }
}
