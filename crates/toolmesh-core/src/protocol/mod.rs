//! Protocol client: owns one transport connection per provider.
//!
//! Each connection is a provider subprocess speaking line-delimited JSON-RPC
//! on its stdin/stdout. The client handshakes, caches the tool list, routes
//! `tools/call` requests, and (when enabled) restarts providers that crash.

pub mod connection;
pub mod discovery;
pub mod handshake;
pub mod process;

pub use connection::RpcConnection;
pub use handshake::{HandshakeOutcome, CLIENT_NAME, PROTOCOL_VERSION};
pub use process::{classify_exit, ExitReason, ProviderProcess};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ClientError;
use crate::events::{ClientErrorKind, ClientEvent, EventChannel};
use crate::models::{ProviderConfig, ProviderTool, Tool};
use discovery::{BatchConfig, BatchedDiscovery, DiscoveryBatch, DiscoveryCache, ToolFilter};

/// `client:` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Extra attempts after the first failed connect.
    pub connect_retries: u32,
    pub retry_delay_ms: u64,
    /// Restart providers that crash. Disabled when a connection manager supervises the client.
    pub restart_on_exit: bool,
    pub max_restarts: u32,
    pub protocol_version: String,
    pub client_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
            connect_retries: 3,
            retry_delay_ms: 2_000,
            restart_on_exit: true,
            max_restarts: 3,
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_name: CLIENT_NAME.to_string(),
        }
    }
}

impl ClientConfig {
    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

struct TransportConnection {
    config: ProviderConfig,
    rpc: Arc<RpcConnection>,
    process: ProviderProcess,
    tools: Vec<Tool>,
    capabilities: Option<Value>,
    connected: bool,
    reconnect_attempts: u32,
    generation: u64,
}

impl TransportConnection {
    async fn teardown(self) {
        self.process.kill();
        self.rpc.close().await;
    }
}

/// A spawned and handshaken provider, not yet installed in the map.
struct Established {
    process: ProviderProcess,
    rpc: Arc<RpcConnection>,
    exited: oneshot::Receiver<ExitReason>,
    outcome: HandshakeOutcome,
}

struct ClientInner {
    config: ClientConfig,
    connections: RwLock<HashMap<String, TransportConnection>>,
    /// Names with an initial connect in flight.
    connecting: std::sync::Mutex<HashSet<String>>,
    events: EventChannel<ClientEvent>,
    cache: Option<DiscoveryCache>,
    filter: ToolFilter,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Cheaply cloneable handle; all clones share the same connections.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

impl ProtocolClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_discovery(config, None, ToolFilter::default())
    }

    /// Build a client that records discoveries in `cache` and hides tools
    /// rejected by `filter`.
    pub fn with_discovery(
        config: ClientConfig,
        cache: Option<DiscoveryCache>,
        filter: ToolFilter,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connections: RwLock::new(HashMap::new()),
                connecting: std::sync::Mutex::new(HashSet::new()),
                events: EventChannel::default(),
                cache,
                filter,
                generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> Option<&DiscoveryCache> {
        self.inner.cache.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    fn filtered(&self, tools: &[Tool]) -> Vec<Tool> {
        let filter = &self.inner.filter;
        if filter.is_empty() {
            tools.to_vec()
        } else {
            filter.apply(tools)
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Spawn, handshake and register a provider. Spawn or handshake failures
    /// are retried `connect_retries` times with a fixed delay.
    pub async fn add_provider(&self, config: ProviderConfig) -> Result<Vec<Tool>, ClientError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ClientError::Closed(config.name.clone()));
        }
        {
            let conns = self.inner.connections.read().await;
            let mut connecting = self.connecting();
            if conns.contains_key(&config.name) || !connecting.insert(config.name.clone()) {
                return Err(ClientError::ProviderExists(config.name.clone()));
            }
        }

        let result = self.connect_with_retry(&config).await;
        self.connecting().remove(&config.name);

        match result {
            Ok(established) => {
                let tools = {
                    let mut conns = self.inner.connections.write().await;
                    self.install(&mut conns, config.clone(), established, 0)
                };
                tracing::info!(
                    "[ProtocolClient:{}] Connected with {} tool(s)",
                    config.name,
                    tools.len()
                );
                self.inner.events.emit(ClientEvent::Connected {
                    provider: config.name.clone(),
                    tools: tools.clone(),
                });
                Ok(tools)
            }
            Err(err) => {
                tracing::error!("[ProtocolClient:{}] {}", config.name, err);
                self.inner.events.emit(ClientEvent::Error {
                    provider: config.name.clone(),
                    kind: ClientErrorKind::ConnectionFailed,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn connect_with_retry(&self, config: &ProviderConfig) -> Result<Established, ClientError> {
        let attempts = self.inner.config.connect_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connect_once(config).await {
                Ok(established) => return Ok(established),
                Err(e) => {
                    tracing::warn!(
                        "[ProtocolClient:{}] Connect attempt {}/{} failed: {}",
                        config.name,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.retry_delay()).await;
                    }
                }
            }
        }
        Err(ClientError::ConnectionFailed {
            provider: config.name.clone(),
            attempts,
            cause: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn connect_once(&self, config: &ProviderConfig) -> Result<Established, ClientError> {
        let spawned = ProviderProcess::spawn(config)?;
        let rpc = Arc::new(RpcConnection::start(
            &config.name,
            spawned.stdout,
            spawned.stdin,
            self.inner.config.request_timeout(),
        ));

        let handshake = handshake::perform(
            &rpc,
            &self.inner.config.protocol_version,
            &self.inner.config.client_name,
            self.inner.config.handshake_timeout(),
        )
        .await;

        match handshake {
            Ok(outcome) => Ok(Established {
                process: spawned.process,
                rpc,
                exited: spawned.exited,
                outcome,
            }),
            Err(e) => {
                spawned.process.kill();
                rpc.close().await;
                Err(e)
            }
        }
    }

    /// Insert a connection and start watching its process. Returns the
    /// filtered tool list.
    fn install(
        &self,
        conns: &mut HashMap<String, TransportConnection>,
        config: ProviderConfig,
        established: Established,
        reconnect_attempts: u32,
    ) -> Vec<Tool> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let name = config.name.clone();

        if let Some(ref cache) = self.inner.cache {
            cache.put(&name, established.outcome.tools.clone());
        }
        let tools = self.filtered(&established.outcome.tools);

        conns.insert(
            name.clone(),
            TransportConnection {
                config,
                rpc: established.rpc,
                process: established.process,
                tools: established.outcome.tools,
                capabilities: established.outcome.capabilities,
                connected: true,
                reconnect_attempts,
                generation,
            },
        );

        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            name,
            generation,
            established.exited,
        ));
        tools
    }

    /// Stop a provider and forget it.
    pub async fn remove_provider(&self, name: &str) -> Result<(), ClientError> {
        let entry = self.inner.connections.write().await.remove(name);
        let Some(entry) = entry else {
            return Err(ClientError::UnknownProvider(name.to_string()));
        };
        tracing::info!("[ProtocolClient:{}] Removing provider", name);
        entry.teardown().await;
        self.inner.events.emit(ClientEvent::Disconnected {
            provider: name.to_string(),
            reason: ExitReason::Requested,
        });
        Ok(())
    }

    /// Stop every provider and close the event channel.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<(String, TransportConnection)> =
            self.inner.connections.write().await.drain().collect();
        for (name, entry) in drained {
            entry.teardown().await;
            self.inner.events.emit(ClientEvent::Disconnected {
                provider: name,
                reason: ExitReason::Requested,
            });
        }
        self.inner.events.close();
        tracing::info!("[ProtocolClient] Shut down");
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub async fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(name)
            .is_some_and(|c| c.connected)
    }

    pub async fn capabilities(&self, name: &str) -> Option<Value> {
        self.inner
            .connections
            .read()
            .await
            .get(name)
            .and_then(|c| c.capabilities.clone())
    }

    /// The tool list recorded at handshake (or the last refresh).
    pub async fn list_tools(&self, name: &str) -> Result<Vec<Tool>, ClientError> {
        let conns = self.inner.connections.read().await;
        match conns.get(name) {
            Some(c) if c.connected => Ok(self.filtered(&c.tools)),
            _ => Err(ClientError::NotConnected(name.to_string())),
        }
    }

    /// Tools from the discovery cache, if one is configured and the entry is fresh.
    pub fn cached_tools(&self, name: &str) -> Option<Vec<Tool>> {
        let tools = self.inner.cache.as_ref()?.get(name)?;
        Some(self.filtered(&tools))
    }

    /// Re-query `tools/list` and replace the recorded list.
    pub async fn fetch_tools(&self, name: &str) -> Result<Vec<Tool>, ClientError> {
        let rpc = self.rpc_for(name).await?;
        let result = rpc.request("tools/list", json!({})).await?;
        let tools = handshake::parse_tools(&result)?;

        if let Some(c) = self.inner.connections.write().await.get_mut(name) {
            c.tools = tools.clone();
        }
        if let Some(ref cache) = self.inner.cache {
            cache.put(name, tools.clone());
        }
        Ok(self.filtered(&tools))
    }

    /// Every connected provider's tools, ordered by provider then tool name.
    pub async fn get_all_tools(&self) -> Vec<ProviderTool> {
        let conns = self.inner.connections.read().await;
        let mut all: Vec<ProviderTool> = conns
            .iter()
            .filter(|(_, c)| c.connected)
            .flat_map(|(name, c)| {
                self.filtered(&c.tools)
                    .into_iter()
                    .map(move |tool| ProviderTool::new(tool, name.clone()))
            })
            .collect();
        all.sort_by(|a, b| {
            a.provider_name
                .cmp(&b.provider_name)
                .then_with(|| a.tool.name.cmp(&b.tool.name))
        });
        all
    }

    /// Stream the aggregate tool list in prioritized batches.
    pub async fn discover_batched(&self, batch: BatchConfig) -> ReceiverStream<DiscoveryBatch> {
        let tools = self.get_all_tools().await;
        BatchedDiscovery::new(batch).stream(tools)
    }

    /// Invoke `tools/call`. Fails immediately if the provider is not connected.
    pub async fn call_tool(
        &self,
        tool: &str,
        provider: &str,
        arguments: Value,
    ) -> Result<Value, ClientError> {
        let rpc = self.rpc_for(provider).await?;
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        tracing::debug!("[ProtocolClient:{}] tools/call {}", provider, tool);
        rpc.request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await
    }

    async fn rpc_for(&self, name: &str) -> Result<Arc<RpcConnection>, ClientError> {
        let conns = self.inner.connections.read().await;
        match conns.get(name) {
            Some(c) if c.connected => Ok(c.rpc.clone()),
            _ => Err(ClientError::NotConnected(name.to_string())),
        }
    }

    fn connecting(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner
            .connecting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Exit handling ──────────────────────────────────────────────────

    async fn handle_exit(&self, name: &str, generation: u64, reason: ExitReason) {
        let cfg = &self.inner.config;
        let mut conns = self.inner.connections.write().await;
        let Some(entry) = conns.get_mut(name) else {
            tracing::debug!("[ProtocolClient:{}] Exit after removal: {}", name, reason);
            return;
        };
        if entry.generation != generation {
            tracing::debug!("[ProtocolClient:{}] Ignoring stale exit: {}", name, reason);
            return;
        }

        tracing::warn!("[ProtocolClient:{}] Provider {}", name, reason);
        entry.connected = false;

        let restart = reason.should_restart()
            && cfg.restart_on_exit
            && !self.inner.shutting_down.load(Ordering::SeqCst)
            && entry.reconnect_attempts < cfg.max_restarts;

        if restart {
            let attempts = entry.reconnect_attempts;
            let rpc = entry.rpc.clone();
            drop(conns);
            rpc.close().await;
            tokio::spawn(restart_loop(
                Arc::downgrade(&self.inner),
                name.to_string(),
                generation,
                attempts,
                reason,
            ));
        } else {
            let removed = conns.remove(name);
            drop(conns);
            if let Some(entry) = removed {
                entry.rpc.close().await;
            }
            self.inner.events.emit(ClientEvent::Disconnected {
                provider: name.to_string(),
                reason,
            });
        }
    }

    /// Whether `name` is still the same, currently disconnected, entry.
    async fn awaiting_restart(&self, name: &str, generation: u64) -> Option<ProviderConfig> {
        let conns = self.inner.connections.read().await;
        conns
            .get(name)
            .filter(|c| c.generation == generation && !c.connected)
            .map(|c| c.config.clone())
    }
}

async fn supervise(
    inner: Weak<ClientInner>,
    name: String,
    generation: u64,
    exited: oneshot::Receiver<ExitReason>,
) {
    let reason = exited.await.unwrap_or(ExitReason::Crashed {
        code: None,
        signal: None,
    });
    if let Some(inner) = inner.upgrade() {
        ProtocolClient { inner }
            .handle_exit(&name, generation, reason)
            .await;
    }
}

async fn restart_loop(
    inner: Weak<ClientInner>,
    name: String,
    generation: u64,
    mut attempts: u32,
    reason: ExitReason,
) {
    loop {
        attempts += 1;
        let Some(strong) = inner.upgrade() else { return };
        let client = ProtocolClient { inner: strong };
        let delay = client.inner.config.retry_delay();

        if let Some(c) = client.inner.connections.write().await.get_mut(&name) {
            c.reconnect_attempts = attempts;
        }
        tracing::info!(
            "[ProtocolClient:{}] Restarting in {:?} (attempt {}/{})",
            name,
            delay,
            attempts,
            client.inner.config.max_restarts
        );
        client.inner.events.emit(ClientEvent::Reconnecting {
            provider: name.clone(),
            attempt: attempts,
            delay_ms: client.inner.config.retry_delay_ms,
        });
        drop(client);

        tokio::time::sleep(delay).await;

        let Some(strong) = inner.upgrade() else { return };
        let client = ProtocolClient { inner: strong };
        if client.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(config) = client.awaiting_restart(&name, generation).await else {
            tracing::debug!("[ProtocolClient:{}] Restart abandoned; provider removed", name);
            return;
        };

        match client.connect_once(&config).await {
            Ok(established) => {
                let mut conns = client.inner.connections.write().await;
                let still_ours = conns
                    .get(&name)
                    .is_some_and(|c| c.generation == generation && !c.connected);
                if !still_ours {
                    drop(conns);
                    established.process.kill();
                    established.rpc.close().await;
                    return;
                }
                let tools = client.install(&mut conns, config, established, 0);
                drop(conns);
                tracing::info!("[ProtocolClient:{}] Restarted", name);
                client.inner.events.emit(ClientEvent::Connected {
                    provider: name.clone(),
                    tools,
                });
                return;
            }
            Err(e) => {
                tracing::warn!("[ProtocolClient:{}] Restart attempt {} failed: {}", name, attempts, e);
                if attempts >= client.inner.config.max_restarts {
                    let removed = {
                        let mut conns = client.inner.connections.write().await;
                        match conns.get(&name) {
                            Some(c) if c.generation == generation => conns.remove(&name),
                            _ => None,
                        }
                    };
                    if removed.is_some() {
                        client.inner.events.emit(ClientEvent::Error {
                            provider: name.clone(),
                            kind: ClientErrorKind::RestartFailed,
                            message: e.to_string(),
                        });
                        client.inner.events.emit(ClientEvent::Disconnected {
                            provider: name.clone(),
                            reason,
                        });
                    }
                    return;
                }
            }
        }
    }
}
