//! JSON-RPC 2.0 protocol types.
//!
//! Outbound frames are built from the typed structs below; inbound lines are
//! parsed into an [`IncomingMessage`] so the reader loop can route them
//! without poking at raw `serde_json::Value`s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Standard JSON-RPC 2.0 error codes
// ---------------------------------------------------------------------------

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC 2.0 request object (always carries an id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification: a request without an id, no reply expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response, success or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Reply to one of our requests.
    Response {
        id: u64,
        outcome: Result<Value, JsonRpcError>,
    },
    /// Request initiated by the peer (has both `id` and `method`).
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Notification initiated by the peer.
    Notification { method: String, params: Value },
}

impl IncomingMessage {
    /// Parse one framed line. Returns `None` for anything that is not a
    /// JSON-RPC object we know how to route (noise, non-numeric response ids).
    pub fn parse(line: &str) -> Option<Self> {
        let msg: Value = serde_json::from_str(line).ok()?;
        Self::from_value(msg)
    }

    pub fn from_value(mut msg: Value) -> Option<Self> {
        let obj = msg.as_object_mut()?;
        let id = obj.remove("id").filter(|v| !v.is_null());
        let method = obj
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_string);
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Some(Self::Request { id, method, params }),
            (None, Some(method)) => Some(Self::Notification { method, params }),
            (Some(id), None) => {
                let id = id.as_u64()?;
                if let Some(err) = obj.remove("error") {
                    let error = serde_json::from_value::<JsonRpcError>(err.clone())
                        .unwrap_or_else(|_| JsonRpcError {
                            code: INTERNAL_ERROR,
                            message: err.to_string(),
                            data: None,
                        });
                    Some(Self::Response {
                        id,
                        outcome: Err(error),
                    })
                } else {
                    let result = obj.remove("result")?;
                    Some(Self::Response {
                        id,
                        outcome: Ok(result),
                    })
                }
            }
            (None, None) => None,
        }
    }
}
