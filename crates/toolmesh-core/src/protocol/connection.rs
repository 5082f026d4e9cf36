//! RpcConnection: JSON-RPC request/response correlation over a byte stream.
//!
//! The connection owns the write half of the transport and a background
//! reader task over the read half:
//!   1. `request()` allocates the next id, registers a oneshot resolver in the
//!      pending map, writes the frame and waits (bounded by a timeout)
//!   2. the reader frames incoming bytes into lines, and resolves the pending
//!      entry whose id matches a response, exactly once
//!   3. when the stream ends every pending request fails with `Closed`
//!
//! It is transport-agnostic: the protocol client feeds it a child's
//! stdout/stdin, tests feed it an in-memory duplex pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::rpc::types::METHOD_NOT_FOUND;
use crate::rpc::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, LineBuffer};

type Resolver = oneshot::Sender<Result<Value, ClientError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Resolver>>>;
type Writer = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

const READ_CHUNK: usize = 8192;

pub struct RpcConnection {
    provider: String,
    writer: Writer,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    request_timeout: Duration,
    reader_handle: JoinHandle<()>,
}

impl RpcConnection {
    /// Start the background reader and return the connection handle.
    pub fn start<R, W>(provider: &str, reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Writer = Arc::new(Mutex::new(Box::new(writer)));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_handle = tokio::spawn(read_loop(
            provider.to_string(),
            reader,
            writer.clone(),
            pending.clone(),
            alive.clone(),
        ));

        Self {
            provider: provider.to_string(),
            writer,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            request_timeout,
            reader_handle,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether the read side is still open.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// The id the next request will carry.
    pub fn next_message_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send a request with the connection's default timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        if !self.is_alive() {
            return Err(ClientError::Closed(self.provider.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Write {
                method: method.to_string(),
                message: e,
            });
        }

        tracing::trace!("[RpcConnection:{}] -> {} (id={})", self.provider, method, id);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed(self.provider.clone())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    id,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        if !self.is_alive() {
            return Err(ClientError::Closed(self.provider.clone()));
        }
        let frame = JsonRpcNotification::new(method, params);
        self.write_frame(&frame)
            .await
            .map_err(|message| ClientError::Write {
                method: method.to_string(),
                message,
            })
    }

    /// Stop reading and fail every pending request.
    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader_handle.abort();
        fail_pending(&self.pending, &self.provider).await;
    }

    async fn write_frame<T: serde::Serialize>(&self, frame: &T) -> Result<(), String> {
        write_line(&self.writer, frame).await
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

async fn write_line<T: serde::Serialize>(writer: &Writer, frame: &T) -> Result<(), String> {
    let mut data = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    data.push('\n');
    let mut writer = writer.lock().await;
    writer
        .write_all(data.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    writer.flush().await.map_err(|e| e.to_string())
}

async fn fail_pending(pending: &PendingMap, provider: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(ClientError::Closed(provider.to_string())));
    }
}

async fn read_loop<R>(
    provider: String,
    mut reader: R,
    writer: Writer,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut framing = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("[RpcConnection:{}] Read error: {}", provider, e);
                break;
            }
        };
        for line in framing.push(&chunk[..n]) {
            dispatch_line(&provider, &line, &writer, &pending).await;
        }
    }

    if let Some(line) = framing.finish() {
        dispatch_line(&provider, &line, &writer, &pending).await;
    }

    alive.store(false, Ordering::SeqCst);
    fail_pending(&pending, &provider).await;
    tracing::debug!("[RpcConnection:{}] reader finished", provider);
}

async fn dispatch_line(provider: &str, line: &str, writer: &Writer, pending: &PendingMap) {
    let Some(msg) = IncomingMessage::parse(line) else {
        tracing::debug!(
            "[RpcConnection:{}] Ignoring non-protocol line: {}",
            provider,
            truncate(line, 200)
        );
        return;
    };

    match msg {
        IncomingMessage::Response { id, outcome } => {
            let resolver = pending.lock().await.remove(&id);
            match resolver {
                Some(tx) => {
                    let result = outcome.map_err(|e| ClientError::Remote {
                        code: e.code,
                        message: e.message,
                    });
                    let _ = tx.send(result);
                }
                None => {
                    tracing::debug!(
                        "[RpcConnection:{}] Ignoring response for unknown or settled id {}",
                        provider,
                        id
                    );
                }
            }
        }
        IncomingMessage::Request { id, method, .. } => {
            // Providers may ping; everything else is unsupported on the client side.
            let reply = if method == "ping" {
                JsonRpcResponse::success(id, serde_json::json!({}))
            } else {
                tracing::debug!("[RpcConnection:{}] Unsupported peer request: {}", provider, method);
                JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
            };
            if let Err(e) = write_line(writer, &reply).await {
                tracing::warn!("[RpcConnection:{}] Failed to answer {}: {}", provider, method, e);
            }
        }
        IncomingMessage::Notification { method, .. } => {
            tracing::debug!("[RpcConnection:{}] Notification: {}", provider, method);
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
