//! Reference tool provider speaking line-delimited JSON-RPC on stdio.
//!
//! Tools:
//! - `echo { text }`: returns the text
//! - `add { a, b }`: returns the sum
//! - `sleep { ms }`: replies after `ms` milliseconds (calls run concurrently)
//! - `fail`: replies with a JSON-RPC error
//! - `error`: replies with an `isError` tool result
//! - `silent`: never replies
//! - `crash { code }`: exits the process with `code` (default 1)
//!
//! Set `ECHO_PROVIDER_NOISE=1` to write a non-JSON line before the first
//! reply. Set `ECHO_PROVIDER_MUTE_AFTER_HANDSHAKE=1` to stop answering once
//! the first `tools/list` has been served. Diagnostics go to stderr.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use toolmesh_core::rpc::types::METHOD_NOT_FOUND;
use toolmesh_core::rpc::{IncomingMessage, JsonRpcResponse};

const PROTOCOL_VERSION: &str = "2024-11-05";
const TOOL_ERROR: i64 = -32000;

type Stdout = Arc<Mutex<tokio::io::Stdout>>;

static MUTED: AtomicBool = AtomicBool::new(false);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let stdout: Stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let noisy = std::env::var("ECHO_PROVIDER_NOISE").is_ok_and(|v| v == "1");
    let mute_after_handshake =
        std::env::var("ECHO_PROVIDER_MUTE_AFTER_HANDSHAKE").is_ok_and(|v| v == "1");
    if noisy {
        write_line(&stdout, "echo-provider starting up (not json)").await;
    }
    eprintln!("[echo-provider] ready (pid {})", std::process::id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("[echo-provider] stdin error: {}", e);
                break;
            }
        };
        let Some(message) = IncomingMessage::parse(&line) else {
            if !line.trim().is_empty() {
                eprintln!("[echo-provider] ignoring line: {}", line);
            }
            continue;
        };
        match message {
            IncomingMessage::Request { id, method, params } => {
                let stdout = stdout.clone();
                // Calls are answered independently so slow tools do not block.
                tokio::spawn(async move {
                    if MUTED.load(Ordering::SeqCst) {
                        eprintln!("[echo-provider] muted, dropping {}", method);
                        return;
                    }
                    if let Some(reply) = handle(id, &method, params).await {
                        send(&stdout, &reply).await;
                    }
                    if mute_after_handshake && method == "tools/list" {
                        MUTED.store(true, Ordering::SeqCst);
                    }
                });
            }
            IncomingMessage::Notification { method, .. } => {
                eprintln!("[echo-provider] notification {}", method);
            }
            IncomingMessage::Response { id, .. } => {
                eprintln!("[echo-provider] unexpected response id={}", id);
            }
        }
    }
    eprintln!("[echo-provider] stdin closed, exiting");
}

async fn handle(id: Value, method: &str, params: Value) -> Option<JsonRpcResponse> {
    let reply = match method {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": "echo-provider", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tool_list() })),
        "tools/call" => return call_tool(id, params).await,
        other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    };
    Some(reply)
}

async fn call_tool(id: Value, params: Value) -> Option<JsonRpcResponse> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let reply = match name {
        "echo" => text_result(id, args.get("text").and_then(Value::as_str).unwrap_or_default()),
        "add" => {
            let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            text_result(id, &(a + b).to_string())
        }
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            text_result(id, &format!("slept {}ms", ms))
        }
        "fail" => JsonRpcResponse::error(id, TOOL_ERROR, "requested failure"),
        "error" => JsonRpcResponse::success(
            id,
            json!({
                "content": [{ "type": "text", "text": "tool reported failure" }],
                "isError": true
            }),
        ),
        "silent" => return None,
        "crash" => {
            let code = args.get("code").and_then(Value::as_i64).unwrap_or(1);
            eprintln!("[echo-provider] crashing with code {}", code);
            std::process::exit(code as i32);
        }
        other => JsonRpcResponse::error(id, TOOL_ERROR, format!("Unknown tool: {}", other)),
    };
    Some(reply)
}

fn text_result(id: Value, text: &str) -> JsonRpcResponse {
    JsonRpcResponse::success(id, json!({ "content": [{ "type": "text", "text": text }] }))
}

fn tool_list() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the given text",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": { "a": { "type": "number" }, "b": { "type": "number" } }
            }
        },
        { "name": "sleep", "description": "Reply after a delay" },
        { "name": "fail", "description": "Always fails" },
        { "name": "error", "description": "Returns an error result" },
        { "name": "silent", "description": "Never replies" },
        { "name": "crash", "description": "Exit the provider process" }
    ])
}

async fn send(stdout: &Stdout, reply: &JsonRpcResponse) {
    match serde_json::to_string(reply) {
        Ok(line) => write_line(stdout, &line).await,
        Err(e) => eprintln!("[echo-provider] failed to encode reply: {}", e),
    }
}

async fn write_line(stdout: &Stdout, line: &str) {
    let mut out = stdout.lock().await;
    let result = async {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await
    }
    .await;
    if let Err(e) = result {
        eprintln!("[echo-provider] stdout write failed: {}", e);
    }
}
