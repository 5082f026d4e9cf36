//! The fixed connect sequence: `initialize` → `notifications/initialized` → `tools/list`.

use std::time::Duration;

use serde_json::{json, Value};

use super::connection::RpcConnection;
use crate::error::ClientError;
use crate::models::Tool;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "toolmesh";

/// What a provider told us while connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeOutcome {
    pub tools: Vec<Tool>,
    pub capabilities: Option<Value>,
    pub server_info: Option<Value>,
    pub protocol_version: Option<String>,
}

pub async fn perform(
    conn: &RpcConnection,
    protocol_version: &str,
    client_name: &str,
    timeout: Duration,
) -> Result<HandshakeOutcome, ClientError> {
    let provider = conn.provider().to_string();
    let fail = |message: String| ClientError::Handshake {
        provider: provider.clone(),
        message,
    };

    let init = conn
        .request_with_timeout(
            "initialize",
            json!({
                "protocolVersion": protocol_version,
                "capabilities": {},
                "clientInfo": {
                    "name": client_name,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
            timeout,
        )
        .await
        .map_err(|e| fail(format!("initialize: {}", e)))?;

    tracing::info!(
        "[Handshake:{}] Initialized (protocol v{})",
        provider,
        init.get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
    );

    conn.notify("notifications/initialized", None)
        .await
        .map_err(|e| fail(format!("notifications/initialized: {}", e)))?;

    let listed = conn
        .request_with_timeout("tools/list", json!({}), timeout)
        .await
        .map_err(|e| fail(format!("tools/list: {}", e)))?;
    let tools = parse_tools(&listed).map_err(|e| fail(e.to_string()))?;

    Ok(HandshakeOutcome {
        tools,
        capabilities: init.get("capabilities").cloned(),
        server_info: init.get("serverInfo").cloned(),
        protocol_version: init
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

/// Extract `result.tools`. A result without a `tools` array is invalid;
/// individual entries without a usable `name` are skipped.
pub fn parse_tools(result: &Value) -> Result<Vec<Tool>, ClientError> {
    let entries = result
        .get("tools")
        .and_then(|t| t.as_array())
        .ok_or_else(|| ClientError::InvalidResponse("tools/list result has no tools array".into()))?;

    Ok(entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<Tool>(entry.clone()) {
            Ok(tool) => Some(tool),
            Err(e) => {
                tracing::debug!("[Handshake] Skipping malformed tool entry: {}", e);
                None
            }
        })
        .collect())
}
