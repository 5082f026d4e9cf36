use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::provider::display_name_for;
use crate::models::Tool;

/// Lifecycle of a supervised provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Reconnecting,
}

impl ProviderStatus {
    /// Legal edges of the status machine. `Connected → Connected` is a
    /// refresh (tool list changed).
    pub fn can_transition_to(self, next: ProviderStatus) -> bool {
        use ProviderStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected | Error | Disconnected)
                | (Connected, Connected | Disconnected | Error)
                | (Disconnected, Connecting | Reconnecting)
                | (Error, Connecting | Reconnecting | Disconnected)
                | (Reconnecting, Connecting | Disconnected | Error)
        )
    }

    /// Counts against `max_connections`.
    pub fn occupies_slot(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the manager knows about one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub provider_id: String,
    pub display_name: String,
    pub status: ProviderStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub tools: Vec<Tool>,
    pub capabilities: Option<Value>,
}

impl ConnectionStatus {
    pub(crate) fn connecting(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            display_name: display_name_for(provider_id),
            status: ProviderStatus::Connecting,
            last_connected: None,
            last_error: None,
            retry_count: 0,
            tools: Vec::new(),
            capabilities: None,
        }
    }
}
