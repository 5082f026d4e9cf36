//! Connection manager: supervises many providers on top of a [`ProviderBackend`].
//!
//! Owns the per-provider [`ConnectionStatus`] map, which is the single source
//! of truth for whether a provider is usable. Enforces the connection cap,
//! consults the security validator, feeds analytics, reconnects with
//! exponential backoff after unexpected exits and runs periodic health checks.

pub mod backend;
pub mod health;
pub mod status;

pub use backend::{ConnectOutcome, ProviderBackend};
pub use health::{compare_tools, HealthOutcome, HealthReport};
pub use status::{ConnectionStatus, ProviderStatus};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::analytics::{AnalyticsSink, ConnectionEvent, ToolCallEvent, TracingAnalytics};
use crate::error::ManagerError;
use crate::events::{ClientEvent, EventChannel, ManagerEvent};
use crate::models::{ProviderConfig, ProviderTool, Tool};
use crate::protocol::discovery::{DiscoveryCache, ToolFilter};
use crate::protocol::{ClientConfig, ProtocolClient};
use crate::security::{AllowAll, SecurityContext, SecurityValidator};

/// `manager:` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    pub max_connections: usize,
    pub auto_reconnect: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Pause between the disconnect and connect halves of `reconnect()`.
    pub reconnect_pause_ms: u64,
    /// `0` disables the background health checker.
    pub health_check_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            auto_reconnect: true,
            max_retries: 5,
            base_delay_ms: 1_000,
            reconnect_pause_ms: 500,
            health_check_interval_ms: 60_000,
        }
    }
}

/// `base * 2^retry`, saturating.
pub fn backoff_delay(base_delay_ms: u64, retry_count: u32) -> Duration {
    Duration::from_millis(base_delay_ms.saturating_mul(2u64.saturating_pow(retry_count)))
}

struct ManagerInner {
    config: ManagerConfig,
    backend: Arc<dyn ProviderBackend>,
    providers: RwLock<Vec<ProviderConfig>>,
    statuses: RwLock<HashMap<String, ConnectionStatus>>,
    events: EventChannel<ManagerEvent>,
    security: std::sync::RwLock<Arc<dyn SecurityValidator>>,
    analytics: std::sync::RwLock<Arc<dyn AnalyticsSink>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    reconnects: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, backend: Arc<dyn ProviderBackend>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                backend,
                providers: RwLock::new(Vec::new()),
                statuses: RwLock::new(HashMap::new()),
                events: EventChannel::default(),
                security: std::sync::RwLock::new(Arc::new(AllowAll)),
                analytics: std::sync::RwLock::new(Arc::new(TracingAnalytics)),
                tasks: std::sync::Mutex::new(Vec::new()),
                reconnects: std::sync::Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Supervise a fresh [`ProtocolClient`]. The client's own restart-on-exit
    /// is switched off so the manager's `retry_count` is the only retry
    /// counter for each provider.
    pub fn with_client(
        config: ManagerConfig,
        client: ClientConfig,
        cache: Option<DiscoveryCache>,
        filter: ToolFilter,
    ) -> Self {
        let client = ProtocolClient::with_discovery(
            ClientConfig {
                restart_on_exit: false,
                ..client
            },
            cache,
            filter,
        );
        Self::new(config, Arc::new(client))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn set_security_validator(&self, validator: Arc<dyn SecurityValidator>) {
        *self
            .inner
            .security
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = validator;
    }

    pub fn set_analytics_sink(&self, sink: Arc<dyn AnalyticsSink>) {
        *self
            .inner
            .analytics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = sink;
    }

    fn security(&self) -> Arc<dyn SecurityValidator> {
        self.inner
            .security
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn analytics(&self) -> Arc<dyn AnalyticsSink> {
        self.inner
            .analytics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    // ── Registry ───────────────────────────────────────────────────────

    pub async fn register_provider(&self, config: ProviderConfig) -> Result<(), ManagerError> {
        let mut providers = self.inner.providers.write().await;
        if providers.iter().any(|p| p.name == config.name) {
            return Err(ManagerError::ProviderExists(config.name));
        }
        tracing::debug!("[ConnectionManager] Registered provider {}", config.name);
        providers.push(config);
        Ok(())
    }

    pub async fn providers(&self) -> Vec<ProviderConfig> {
        self.inner.providers.read().await.clone()
    }

    async fn provider_config(&self, id: &str) -> Option<ProviderConfig> {
        self.inner
            .providers
            .read()
            .await
            .iter()
            .find(|p| p.name == id)
            .cloned()
    }

    // ── Status machine ─────────────────────────────────────────────────

    /// Apply a legal transition and publish it. Illegal transitions are
    /// logged and leave the status untouched.
    fn transition(
        &self,
        statuses: &mut HashMap<String, ConnectionStatus>,
        id: &str,
        next: ProviderStatus,
        tools_changed: bool,
    ) -> bool {
        let Some(entry) = statuses.get_mut(id) else {
            return false;
        };
        let previous = entry.status;
        if !previous.can_transition_to(next) {
            tracing::warn!(
                "[ConnectionManager:{}] Rejected status transition {} -> {}",
                id,
                previous,
                next
            );
            return false;
        }
        entry.status = next;
        self.inner.events.emit(ManagerEvent::Status {
            provider: id.to_string(),
            status: next,
            previous: Some(previous),
            tools_changed,
        });
        true
    }

    // ── Connect / disconnect ───────────────────────────────────────────

    /// Connect a registered provider.
    pub async fn connect(&self, id: &str) -> Result<Vec<Tool>, ManagerError> {
        self.cancel_scheduled_reconnect(id).await;
        self.connect_inner(id).await
    }

    async fn connect_inner(&self, id: &str) -> Result<Vec<Tool>, ManagerError> {
        let config = self
            .provider_config(id)
            .await
            .ok_or_else(|| ManagerError::UnknownProvider(id.to_string()))?;

        let verdict = self
            .security()
            .validate_connection(&config, &SecurityContext::for_provider(id))
            .await;
        if !verdict.allowed {
            let reason = verdict
                .reason
                .unwrap_or_else(|| format!("connection to '{}' denied", id));
            tracing::warn!("[ConnectionManager:{}] {}", id, reason);
            return Err(ManagerError::SecurityDenied(reason));
        }

        {
            let mut statuses = self.inner.statuses.write().await;
            if let Some(current) = statuses.get(id).map(|s| s.status) {
                if current.occupies_slot() {
                    return Err(ManagerError::AlreadyConnected(id.to_string()));
                }
            }
            let occupied = statuses
                .values()
                .filter(|s| s.provider_id != id && s.status.occupies_slot())
                .count();
            if occupied >= self.inner.config.max_connections {
                return Err(ManagerError::CapacityExceeded {
                    max: self.inner.config.max_connections,
                });
            }
            if statuses.contains_key(id) {
                self.transition(&mut statuses, id, ProviderStatus::Connecting, false);
            } else {
                statuses.insert(id.to_string(), ConnectionStatus::connecting(id));
                self.inner.events.emit(ManagerEvent::Status {
                    provider: id.to_string(),
                    status: ProviderStatus::Connecting,
                    previous: None,
                    tools_changed: false,
                });
            }
        }

        tracing::info!("[ConnectionManager:{}] Connecting", id);
        let started = Instant::now();
        let result = self.inner.backend.connect(&config).await;
        self.analytics()
            .record_connection_event(ConnectionEvent {
                provider: id.to_string(),
                success: result.is_ok(),
                duration_ms: elapsed_ms(started),
                error: result.as_ref().err().map(|e| e.to_string()),
                timestamp: Utc::now(),
            })
            .await;

        match result {
            Ok(outcome) => {
                let mut statuses = self.inner.statuses.write().await;
                if !self.transition(&mut statuses, id, ProviderStatus::Connected, false) {
                    // Disconnected while the connect was in flight.
                    drop(statuses);
                    let _ = self.inner.backend.disconnect(id).await;
                    return Err(ManagerError::NotConnected(id.to_string()));
                }
                if let Some(entry) = statuses.get_mut(id) {
                    entry.last_connected = Some(Utc::now());
                    entry.last_error = None;
                    entry.retry_count = 0;
                    entry.tools = outcome.tools.clone();
                    entry.capabilities = outcome.capabilities;
                }
                drop(statuses);
                tracing::info!(
                    "[ConnectionManager:{}] Connected ({} tools)",
                    id,
                    outcome.tools.len()
                );
                self.inner.events.emit(ManagerEvent::ServerConnected {
                    provider: id.to_string(),
                    tools: outcome.tools.clone(),
                });
                Ok(outcome.tools)
            }
            Err(e) => {
                let message = e.to_string();
                let mut statuses = self.inner.statuses.write().await;
                if self.transition(&mut statuses, id, ProviderStatus::Error, false) {
                    if let Some(entry) = statuses.get_mut(id) {
                        entry.last_error = Some(message.clone());
                    }
                }
                drop(statuses);
                tracing::error!("[ConnectionManager:{}] Connect failed: {}", id, message);
                self.inner.events.emit(ManagerEvent::Error {
                    provider: id.to_string(),
                    message,
                });
                Err(e.into())
            }
        }
    }

    /// Disconnect a provider. Unknown or already-disconnected providers are a
    /// silent no-op.
    pub async fn disconnect(&self, id: &str) -> Result<(), ManagerError> {
        let current = self.inner.statuses.read().await.get(id).map(|s| s.status);
        match current {
            None | Some(ProviderStatus::Disconnected) => return Ok(()),
            Some(ProviderStatus::Reconnecting) => self.abort_reconnect(id),
            Some(_) => {}
        }

        if let Err(e) = self.inner.backend.disconnect(id).await {
            tracing::debug!("[ConnectionManager:{}] Backend disconnect: {}", id, e);
        }

        let mut statuses = self.inner.statuses.write().await;
        let changed = self.transition(&mut statuses, id, ProviderStatus::Disconnected, false);
        if changed {
            if let Some(entry) = statuses.get_mut(id) {
                entry.tools.clear();
            }
        }
        drop(statuses);
        if changed {
            tracing::info!("[ConnectionManager:{}] Disconnected", id);
            self.inner.events.emit(ManagerEvent::ServerDisconnected {
                provider: id.to_string(),
                unexpected: false,
            });
        }
        Ok(())
    }

    /// Disconnect, pause briefly, connect again.
    pub async fn reconnect(&self, id: &str) -> Result<Vec<Tool>, ManagerError> {
        self.disconnect(id).await?;
        tokio::time::sleep(Duration::from_millis(self.inner.config.reconnect_pause_ms)).await;
        self.connect(id).await
    }

    /// Connect several providers concurrently; one failure does not stop the rest.
    /// Results come back in the order the ids were given.
    pub async fn connect_multiple<I, S>(&self, ids: I) -> Vec<(String, Result<Vec<Tool>, ManagerError>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let mut set = JoinSet::new();
        for (index, id) in ids.iter().cloned().enumerate() {
            let manager = self.clone();
            set.spawn(async move {
                let result = manager.connect(&id).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<Vec<Tool>, ManagerError>>> = vec![None; ids.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!("[ConnectionManager] connect task failed: {}", e),
            }
        }

        ids.into_iter()
            .zip(results)
            .map(|(id, result)| {
                let result = result.unwrap_or_else(|| Err(ManagerError::NotConnected(id.clone())));
                (id, result)
            })
            .collect()
    }

    // ── Tool calls ─────────────────────────────────────────────────────

    pub async fn call_tool(&self, tool: &str, provider: &str, arguments: Value) -> Result<Value, ManagerError> {
        self.call_tool_with_context(tool, provider, arguments, SecurityContext::for_provider(provider))
            .await
    }

    /// Invoke a tool with caller context for the security validator.
    /// Analytics are recorded whatever the outcome.
    pub async fn call_tool_with_context(
        &self,
        tool: &str,
        provider: &str,
        arguments: Value,
        ctx: SecurityContext,
    ) -> Result<Value, ManagerError> {
        let started = Instant::now();
        let result = self.invoke(tool, provider, arguments, ctx).await;
        self.analytics()
            .record_tool_call_event(ToolCallEvent {
                provider: provider.to_string(),
                tool: tool.to_string(),
                success: result.is_ok(),
                duration_ms: elapsed_ms(started),
                error: result.as_ref().err().map(|e| e.to_string()),
                timestamp: Utc::now(),
            })
            .await;
        result
    }

    async fn invoke(
        &self,
        tool: &str,
        provider: &str,
        arguments: Value,
        mut ctx: SecurityContext,
    ) -> Result<Value, ManagerError> {
        let descriptor = {
            let statuses = self.inner.statuses.read().await;
            match statuses.get(provider) {
                Some(s) if s.status == ProviderStatus::Connected => s
                    .tools
                    .iter()
                    .find(|t| t.name == tool)
                    .cloned()
                    .ok_or_else(|| ManagerError::UnknownTool {
                        tool: tool.to_string(),
                        provider: provider.to_string(),
                    })?,
                _ => return Err(ManagerError::NotConnected(provider.to_string())),
            }
        };

        ctx.provider = provider.to_string();
        ctx.arguments = Some(arguments.clone());
        let verdict = self.security().validate_tool_call(&descriptor, &ctx).await;
        if !verdict.allowed {
            return Err(ManagerError::SecurityDenied(
                verdict
                    .reason
                    .unwrap_or_else(|| format!("call to '{}' denied", tool)),
            ));
        }

        Ok(self.inner.backend.call_tool(tool, provider, arguments).await?)
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub async fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.inner.statuses.read().await.get(id).cloned()
    }

    pub async fn statuses(&self) -> Vec<ConnectionStatus> {
        let mut all: Vec<ConnectionStatus> = self.inner.statuses.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        all
    }

    /// Tools of every connected provider, ordered by provider then name.
    pub async fn available_tools(&self) -> Vec<ProviderTool> {
        let statuses = self.inner.statuses.read().await;
        let mut tools: Vec<ProviderTool> = statuses
            .values()
            .filter(|s| s.status == ProviderStatus::Connected)
            .flat_map(|s| {
                s.tools
                    .iter()
                    .cloned()
                    .map(|t| ProviderTool::new(t, s.provider_id.clone()))
            })
            .collect();
        tools.sort_by(|a, b| {
            a.provider_name
                .cmp(&b.provider_name)
                .then_with(|| a.tool.name.cmp(&b.tool.name))
        });
        tools
    }

    // ── Background work ────────────────────────────────────────────────

    /// Start the client-event pump and the health checker. Idempotent.
    pub fn start(&self) {
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tasks.push(tokio::spawn(event_pump(weak.clone(), self.inner.backend.subscribe())));

        let interval = self.inner.config.health_check_interval_ms;
        if interval > 0 {
            tasks.push(tokio::spawn(health_loop(weak, Duration::from_millis(interval))));
        }
        tracing::debug!("[ConnectionManager] Started background tasks");
    }

    /// Re-query every connected provider's tool list once.
    pub async fn run_health_check(&self) -> Vec<HealthReport> {
        let connected: Vec<(String, Vec<Tool>)> = self
            .inner
            .statuses
            .read()
            .await
            .values()
            .filter(|s| s.status == ProviderStatus::Connected)
            .map(|s| (s.provider_id.clone(), s.tools.clone()))
            .collect();

        let mut reports = Vec::with_capacity(connected.len());
        for (id, cached) in connected {
            let outcome = match self.inner.backend.list_tools(&id).await {
                Ok(live) => {
                    let outcome = compare_tools(&cached, &live);
                    if outcome != HealthOutcome::Unchanged {
                        let mut statuses = self.inner.statuses.write().await;
                        let still_connected = statuses
                            .get(&id)
                            .is_some_and(|s| s.status == ProviderStatus::Connected);
                        if still_connected {
                            if let Some(entry) = statuses.get_mut(&id) {
                                entry.tools = live;
                            }
                            self.transition(&mut statuses, &id, ProviderStatus::Connected, true);
                            tracing::info!("[ConnectionManager:{}] Tool list changed", id);
                        }
                    }
                    outcome
                }
                Err(e) => {
                    let error = e.to_string();
                    let mut statuses = self.inner.statuses.write().await;
                    let moved = self.transition(&mut statuses, &id, ProviderStatus::Error, false);
                    if moved {
                        if let Some(entry) = statuses.get_mut(&id) {
                            entry.last_error = Some(error.clone());
                            entry.tools.clear();
                        }
                    }
                    drop(statuses);
                    tracing::warn!("[ConnectionManager:{}] Health check failed: {}", id, error);

                    if moved {
                        // The client still holds the unresponsive connection and its process.
                        if let Err(e) = self.inner.backend.disconnect(&id).await {
                            tracing::debug!(
                                "[ConnectionManager:{}] Dropping stale connection: {}",
                                id,
                                e
                            );
                        }
                    }
                    self.inner.events.emit(ManagerEvent::Error {
                        provider: id.clone(),
                        message: error.clone(),
                    });
                    if moved && self.inner.config.auto_reconnect {
                        self.spawn_reconnect_loop(&id, ProviderStatus::Error);
                    }
                    HealthOutcome::Failed { error }
                }
            };
            reports.push(HealthReport { provider: id, outcome });
        }
        reports
    }

    async fn handle_client_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Disconnected { provider, reason } if reason.is_unexpected() => {
                let mut statuses = self.inner.statuses.write().await;
                let was_connected = statuses
                    .get(&provider)
                    .is_some_and(|s| s.status == ProviderStatus::Connected);
                if !was_connected
                    || !self.transition(&mut statuses, &provider, ProviderStatus::Disconnected, false)
                {
                    return;
                }
                if let Some(entry) = statuses.get_mut(&provider) {
                    entry.last_error = Some(format!("Provider {}", reason));
                    entry.tools.clear();
                }
                drop(statuses);

                tracing::warn!("[ConnectionManager:{}] Unexpected disconnect: {}", provider, reason);
                self.inner.events.emit(ManagerEvent::ServerDisconnected {
                    provider: provider.clone(),
                    unexpected: true,
                });
                if self.inner.config.auto_reconnect {
                    self.spawn_reconnect_loop(&provider, ProviderStatus::Disconnected);
                }
            }
            ClientEvent::Connected { provider, tools } => {
                let mut statuses = self.inner.statuses.write().await;
                let changed = statuses
                    .get(&provider)
                    .is_some_and(|s| s.status == ProviderStatus::Connected && s.tools != tools);
                if changed {
                    if let Some(entry) = statuses.get_mut(&provider) {
                        entry.tools = tools;
                    }
                    self.transition(&mut statuses, &provider, ProviderStatus::Connected, true);
                }
            }
            other => {
                tracing::debug!(
                    "[ConnectionManager:{}] client event: {}",
                    other.provider(),
                    other.name()
                );
            }
        }
    }

    // ── Reconnection ───────────────────────────────────────────────────

    /// `from` is the status the provider is expected to be in when the
    /// first attempt is scheduled.
    fn spawn_reconnect_loop(&self, id: &str, from: ProviderStatus) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(reconnect_loop(
            Arc::downgrade(&self.inner),
            id.to_string(),
            from,
        ));
        if let Some(previous) = self.reconnects().insert(id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Only a loop that is waiting out its delay is aborted; one that is
    /// mid-connect finishes on its own.
    async fn cancel_scheduled_reconnect(&self, id: &str) {
        let waiting = self
            .inner
            .statuses
            .read()
            .await
            .get(id)
            .is_some_and(|s| s.status == ProviderStatus::Reconnecting);
        if waiting {
            self.abort_reconnect(id);
        }
    }

    fn abort_reconnect(&self, id: &str) {
        if let Some(handle) = self.reconnects().remove(id) {
            handle.abort();
        }
    }

    /// Move to `reconnecting` and return the backoff delay, or `None` when
    /// the provider should not be retried.
    async fn prepare_reconnect(&self, id: &str, expected: ProviderStatus) -> Option<Duration> {
        if !self.inner.config.auto_reconnect || self.inner.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        let mut statuses = self.inner.statuses.write().await;
        let entry = statuses.get(id)?;
        if entry.status != expected {
            return None;
        }

        let retry_count = entry.retry_count;
        if retry_count >= self.inner.config.max_retries {
            drop(statuses);
            tracing::error!(
                "[ConnectionManager:{}] Giving up after {} reconnect attempt(s)",
                id,
                retry_count
            );
            self.inner.events.emit(ManagerEvent::Error {
                provider: id.to_string(),
                message: format!("Giving up after {} reconnect attempt(s)", retry_count),
            });
            return None;
        }

        let delay = backoff_delay(self.inner.config.base_delay_ms, retry_count);
        if !self.transition(&mut statuses, id, ProviderStatus::Reconnecting, false) {
            return None;
        }
        tracing::info!(
            "[ConnectionManager:{}] Reconnecting in {:?} (retry {}/{})",
            id,
            delay,
            retry_count + 1,
            self.inner.config.max_retries
        );
        Some(delay)
    }

    /// One reconnect attempt. Returns `true` when the loop should stop.
    async fn try_reconnect(&self, id: &str) -> bool {
        {
            let mut statuses = self.inner.statuses.write().await;
            match statuses.get_mut(id) {
                Some(entry) if entry.status == ProviderStatus::Reconnecting => entry.retry_count += 1,
                _ => return true,
            }
        }

        match self.connect_inner(id).await {
            Ok(_) => true,
            Err(ManagerError::AlreadyConnected(_)) => true,
            Err(e) => {
                tracing::warn!("[ConnectionManager:{}] Reconnect attempt failed: {}", id, e);
                // Refusals before the backend was reached leave the status untouched.
                let mut statuses = self.inner.statuses.write().await;
                if statuses
                    .get(id)
                    .is_some_and(|s| s.status == ProviderStatus::Reconnecting)
                    && self.transition(&mut statuses, id, ProviderStatus::Error, false)
                {
                    if let Some(entry) = statuses.get_mut(id) {
                        entry.last_error = Some(e.to_string());
                    }
                }
                false
            }
        }
    }

    /// Stop background work, disconnect every provider and close the event channel.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for handle in self.tasks().drain(..) {
            handle.abort();
        }
        for (_, handle) in self.reconnects().drain() {
            handle.abort();
        }

        self.inner.backend.shutdown().await;

        let mut statuses = self.inner.statuses.write().await;
        let ids: Vec<String> = statuses
            .values()
            .filter(|s| s.status != ProviderStatus::Disconnected)
            .map(|s| s.provider_id.clone())
            .collect();
        for id in ids {
            if self.transition(&mut statuses, &id, ProviderStatus::Disconnected, false) {
                if let Some(entry) = statuses.get_mut(&id) {
                    entry.tools.clear();
                }
            }
        }
        drop(statuses);
        self.inner.events.close();
        tracing::info!("[ConnectionManager] Shut down");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reconnects(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.inner
            .reconnects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn event_pump(inner: Weak<ManagerInner>, mut rx: broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("[ConnectionManager] Event pump lagged by {} event(s)", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else { break };
        ConnectionManager { inner }.handle_client_event(event).await;
    }
}

async fn health_loop(inner: Weak<ManagerInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        ConnectionManager { inner }.run_health_check().await;
    }
}

async fn reconnect_loop(inner: Weak<ManagerInner>, id: String, from: ProviderStatus) {
    let mut expected = from;
    loop {
        let Some(strong) = inner.upgrade() else { return };
        let manager = ConnectionManager { inner: strong };
        let Some(delay) = manager.prepare_reconnect(&id, expected).await else {
            manager.reconnects().remove(&id);
            return;
        };
        drop(manager);
        // A failed attempt leaves the provider in `error`.
        expected = ProviderStatus::Error;

        tokio::time::sleep(delay).await;

        let Some(strong) = inner.upgrade() else { return };
        let manager = ConnectionManager { inner: strong };
        if manager.try_reconnect(&id).await {
            manager.reconnects().remove(&id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{ConnectionEvent, ToolCallEvent};
    use crate::error::ClientError;
    use crate::protocol::ExitReason;
    use crate::security::Verdict;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBackend {
        tools: Mutex<HashMap<String, Vec<Tool>>>,
        fail_connect: AtomicBool,
        fail_list: AtomicBool,
        connects: AtomicU32,
        disconnects: AtomicU32,
        calls: Mutex<Vec<(String, String, Value)>>,
        events: EventChannel<ClientEvent>,
    }

    impl MockBackend {
        fn with_tools(provider: &str, names: &[&str]) -> Arc<Self> {
            let backend = Self::default();
            backend.set_tools(provider, names);
            Arc::new(backend)
        }

        fn set_tools(&self, provider: &str, names: &[&str]) {
            self.tools.lock().unwrap().insert(
                provider.to_string(),
                names.iter().map(|n| Tool::new(*n)).collect(),
            );
        }

        fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderBackend for MockBackend {
        async fn connect(&self, config: &ProviderConfig) -> Result<ConnectOutcome, ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ClientError::Spawn {
                    provider: config.name.clone(),
                    message: "refused".into(),
                });
            }
            let tools = self.tools.lock().unwrap().get(&config.name).cloned().unwrap_or_default();
            Ok(ConnectOutcome {
                tools,
                capabilities: Some(json!({ "tools": {} })),
            })
        }

        async fn disconnect(&self, _provider: &str) -> Result<(), ClientError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_tools(&self, provider: &str) -> Result<Vec<Tool>, ClientError> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(ClientError::Timeout {
                    method: "tools/list".into(),
                    id: 9,
                    timeout_ms: 30_000,
                });
            }
            Ok(self.tools.lock().unwrap().get(provider).cloned().unwrap_or_default())
        }

        async fn call_tool(&self, tool: &str, provider: &str, arguments: Value) -> Result<Value, ClientError> {
            self.calls
                .lock()
                .unwrap()
                .push((tool.to_string(), provider.to_string(), arguments.clone()));
            Ok(json!({ "content": [{ "type": "text", "text": arguments.to_string() }] }))
        }

        fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
            self.events.subscribe()
        }

        async fn shutdown(&self) {
            self.events.close();
        }
    }

    #[derive(Default)]
    struct RecordingAnalytics {
        connections: Mutex<Vec<ConnectionEvent>>,
        calls: Mutex<Vec<ToolCallEvent>>,
    }

    #[async_trait]
    impl AnalyticsSink for RecordingAnalytics {
        async fn record_connection_event(&self, event: ConnectionEvent) {
            self.connections.lock().unwrap().push(event);
        }

        async fn record_tool_call_event(&self, event: ToolCallEvent) {
            self.calls.lock().unwrap().push(event);
        }
    }

    struct DenyTool(&'static str);

    #[async_trait]
    impl SecurityValidator for DenyTool {
        async fn validate_connection(&self, _config: &ProviderConfig, _ctx: &SecurityContext) -> Verdict {
            Verdict::allow()
        }

        async fn validate_tool_call(&self, tool: &Tool, _ctx: &SecurityContext) -> Verdict {
            if tool.name == self.0 {
                Verdict::deny(format!("{} is blocked", tool.name))
            } else {
                Verdict::allow()
            }
        }
    }

    async fn manager_with(config: ManagerConfig, backend: Arc<MockBackend>, ids: &[&str]) -> ConnectionManager {
        let manager = ConnectionManager::new(config, backend);
        for id in ids {
            manager
                .register_provider(ProviderConfig::new(*id, "unused"))
                .await
                .unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_connect_unknown_provider() {
        let manager = manager_with(ManagerConfig::default(), Arc::new(MockBackend::default()), &[]).await;
        assert_eq!(
            manager.connect("ghost").await,
            Err(ManagerError::UnknownProvider("ghost".into()))
        );
        assert!(manager.status("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = manager_with(ManagerConfig::default(), Arc::new(MockBackend::default()), &["fs"]).await;
        assert_eq!(
            manager.register_provider(ProviderConfig::new("fs", "other")).await,
            Err(ManagerError::ProviderExists("fs".into()))
        );
        assert_eq!(manager.providers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_publishes_status_sequence() {
        let backend = MockBackend::with_tools("fs", &["read_file", "write_file"]);
        let manager = manager_with(ManagerConfig::default(), backend, &["fs"]).await;
        let mut events = manager.subscribe();

        let tools = manager.connect("fs").await.unwrap();
        assert_eq!(tools.len(), 2);

        match events.recv().await.unwrap() {
            ManagerEvent::Status { status, previous, .. } => {
                assert_eq!(status, ProviderStatus::Connecting);
                assert_eq!(previous, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        match events.recv().await.unwrap() {
            ManagerEvent::Status { status, previous, .. } => {
                assert_eq!(status, ProviderStatus::Connected);
                assert_eq!(previous, Some(ProviderStatus::Connecting));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events.recv().await.unwrap().name(), "server_connected");

        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Connected);
        assert!(status.last_connected.is_some());
        assert_eq!(status.capabilities, Some(json!({ "tools": {} })));
        assert_eq!(status.display_name, "Fs");

        assert_eq!(
            manager.connect("fs").await,
            Err(ManagerError::AlreadyConnected("fs".into()))
        );
    }

    #[tokio::test]
    async fn test_capacity_exceeded_has_no_side_effects() {
        let config = ManagerConfig {
            max_connections: 1,
            ..ManagerConfig::default()
        };
        let backend = Arc::new(MockBackend::default());
        let manager = manager_with(config, backend.clone(), &["a", "b"]).await;
        manager.connect("a").await.unwrap();

        assert_eq!(
            manager.connect("b").await,
            Err(ManagerError::CapacityExceeded { max: 1 })
        );
        assert!(manager.status("b").await.is_none());
        assert_eq!(backend.connects(), 1);

        manager.disconnect("a").await.unwrap();
        manager.connect("b").await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager_with(ManagerConfig::default(), Arc::new(MockBackend::default()), &["fs"]).await;
        manager.disconnect("fs").await.unwrap();
        manager.disconnect("never-registered").await.unwrap();

        manager.connect("fs").await.unwrap();
        manager.disconnect("fs").await.unwrap();
        assert_eq!(
            manager.status("fs").await.unwrap().status,
            ProviderStatus::Disconnected
        );

        let mut events = manager.subscribe();
        manager.disconnect("fs").await.unwrap();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_records_error() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_connect.store(true, Ordering::SeqCst);
        let analytics = Arc::new(RecordingAnalytics::default());
        let manager = manager_with(ManagerConfig::default(), backend, &["fs"]).await;
        manager.set_analytics_sink(analytics.clone());

        let err = manager.connect("fs").await.unwrap_err();
        assert!(matches!(err, ManagerError::Client(ClientError::Spawn { .. })));
        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Error);
        assert!(status.last_error.unwrap().contains("refused"));

        let recorded = analytics.connections.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].success);
    }

    #[tokio::test]
    async fn test_call_tool_guards_and_analytics() {
        let backend = MockBackend::with_tools("fs", &["read_file"]);
        let analytics = Arc::new(RecordingAnalytics::default());
        let manager = manager_with(ManagerConfig::default(), backend.clone(), &["fs"]).await;
        manager.set_analytics_sink(analytics.clone());

        assert_eq!(
            manager.call_tool("read_file", "fs", json!({})).await,
            Err(ManagerError::NotConnected("fs".into()))
        );

        manager.connect("fs").await.unwrap();
        assert_eq!(
            manager.call_tool("delete_all", "fs", json!({})).await,
            Err(ManagerError::UnknownTool {
                tool: "delete_all".into(),
                provider: "fs".into()
            })
        );

        let result = manager
            .call_tool("read_file", "fs", json!({ "path": "a.txt" }))
            .await
            .unwrap();
        assert!(result["content"][0]["text"].as_str().unwrap().contains("a.txt"));
        assert_eq!(backend.calls.lock().unwrap().len(), 1);

        let calls = analytics.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls.iter().filter(|c| c.success).count(),
            1,
            "only the last call succeeded"
        );
    }

    #[tokio::test]
    async fn test_security_validator_blocks_tool() {
        let backend = MockBackend::with_tools("fs", &["read_file", "rm"]);
        let manager = manager_with(ManagerConfig::default(), backend.clone(), &["fs"]).await;
        manager.set_security_validator(Arc::new(DenyTool("rm")));
        manager.connect("fs").await.unwrap();

        assert_eq!(
            manager.call_tool("rm", "fs", json!({})).await,
            Err(ManagerError::SecurityDenied("rm is blocked".into()))
        );
        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(manager.call_tool("read_file", "fs", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_multiple_is_best_effort() {
        let manager = manager_with(ManagerConfig::default(), Arc::new(MockBackend::default()), &["a", "b"]).await;
        let results = manager.connect_multiple(["a", "ghost", "b"]).await;
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "ghost", "b"]);
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1, Err(ManagerError::UnknownProvider("ghost".into())));
        assert!(results[2].1.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_pauses_between_halves() {
        let backend = Arc::new(MockBackend::default());
        let manager = manager_with(ManagerConfig::default(), backend.clone(), &["fs"]).await;
        manager.connect("fs").await.unwrap();

        let started = tokio::time::Instant::now();
        manager.reconnect("fs").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(backend.connects(), 2);
        assert_eq!(
            manager.status("fs").await.unwrap().status,
            ProviderStatus::Connected
        );
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1_000, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1_000, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(1_000, 3), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(u64::MAX, 5), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_exit_reconnects_with_exponential_backoff() {
        let config = ManagerConfig {
            max_retries: 2,
            base_delay_ms: 1_000,
            health_check_interval_ms: 0,
            ..ManagerConfig::default()
        };
        let backend = Arc::new(MockBackend::default());
        let manager = manager_with(config, backend.clone(), &["fs"]).await;
        manager.connect("fs").await.unwrap();
        manager.start();
        backend.fail_connect.store(true, Ordering::SeqCst);

        backend.events.emit(ClientEvent::Disconnected {
            provider: "fs".into(),
            reason: ExitReason::Crashed {
                code: Some(1),
                signal: None,
            },
        });

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(backend.connects(), 1);
        assert_eq!(
            manager.status("fs").await.unwrap().status,
            ProviderStatus::Reconnecting
        );

        // First retry at 1s, second 2s later.
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(backend.connects(), 2);
        assert_eq!(manager.status("fs").await.unwrap().retry_count, 1);

        tokio::time::sleep(Duration::from_millis(1_998)).await;
        assert_eq!(backend.connects(), 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(backend.connects(), 3);

        // Ceiling reached: no further attempts, provider left in error.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.connects(), 3);
        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Error);
        assert_eq!(status.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_resets_retry_count() {
        let config = ManagerConfig {
            health_check_interval_ms: 0,
            ..ManagerConfig::default()
        };
        let backend = Arc::new(MockBackend::default());
        let manager = manager_with(config, backend.clone(), &["fs"]).await;
        manager.connect("fs").await.unwrap();
        manager.start();

        backend.events.emit(ClientEvent::Disconnected {
            provider: "fs".into(),
            reason: ExitReason::Clean,
        });
        tokio::time::sleep(Duration::from_millis(1_001)).await;

        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Connected);
        assert_eq!(status.retry_count, 0);
        assert_eq!(backend.connects(), 2);
    }

    #[tokio::test]
    async fn test_requested_disconnect_event_is_ignored() {
        let backend = Arc::new(MockBackend::default());
        let manager = manager_with(ManagerConfig::default(), backend.clone(), &["fs"]).await;
        manager.connect("fs").await.unwrap();
        manager
            .handle_client_event(ClientEvent::Disconnected {
                provider: "fs".into(),
                reason: ExitReason::Requested,
            })
            .await;
        assert_eq!(
            manager.status("fs").await.unwrap().status,
            ProviderStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_health_check_detects_changes_and_failures() {
        let config = ManagerConfig {
            auto_reconnect: false,
            ..ManagerConfig::default()
        };
        let backend = MockBackend::with_tools("fs", &["read_file"]);
        let manager = manager_with(config, backend.clone(), &["fs"]).await;
        manager.connect("fs").await.unwrap();

        let reports = manager.run_health_check().await;
        assert_eq!(reports[0].outcome, HealthOutcome::Unchanged);

        backend.set_tools("fs", &["read_file", "search"]);
        let mut events = manager.subscribe();
        let reports = manager.run_health_check().await;
        assert_eq!(
            reports[0].outcome,
            HealthOutcome::ToolsChanged {
                added: vec!["search".into()],
                removed: vec![],
            }
        );
        match events.recv().await.unwrap() {
            ManagerEvent::Status {
                status,
                tools_changed,
                ..
            } => {
                assert_eq!(status, ProviderStatus::Connected);
                assert!(tools_changed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.available_tools().await.len(), 2);

        backend.fail_list.store(true, Ordering::SeqCst);
        let reports = manager.run_health_check().await;
        assert!(!reports[0].is_healthy());
        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Error);
        assert!(status.last_error.unwrap().contains("tools/list"));
        assert_eq!(backend.disconnects.load(Ordering::SeqCst), 1);
        assert!(manager.available_tools().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_provider_is_dropped_and_reconnected() {
        let config = ManagerConfig {
            base_delay_ms: 1_000,
            health_check_interval_ms: 0,
            ..ManagerConfig::default()
        };
        let backend = MockBackend::with_tools("fs", &["read_file"]);
        let manager = manager_with(config, backend.clone(), &["fs"]).await;
        manager.connect("fs").await.unwrap();

        // Handshake succeeded, but the provider stopped answering.
        backend.fail_list.store(true, Ordering::SeqCst);
        let reports = manager.run_health_check().await;
        assert!(!reports[0].is_healthy());
        assert_eq!(backend.disconnects.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Reconnecting);
        assert_eq!(backend.connects(), 1);

        backend.fail_list.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let status = manager.status("fs").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Connected);
        assert_eq!(status.retry_count, 0);
        assert_eq!(backend.connects(), 2);
        assert_eq!(manager.available_tools().await.len(), 1);

        let reports = manager.run_health_check().await;
        assert!(reports[0].is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_closes_events() {
        let manager = manager_with(ManagerConfig::default(), Arc::new(MockBackend::default()), &["a"]).await;
        manager.connect("a").await.unwrap();
        manager.start();
        let mut events = manager.subscribe();
        manager.shutdown().await;

        assert_eq!(
            manager.status("a").await.unwrap().status,
            ProviderStatus::Disconnected
        );
        // The final status change is delivered before closure.
        assert_eq!(events.recv().await.unwrap().name(), "status");
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
