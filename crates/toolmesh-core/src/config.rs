//! Top-level configuration file.
//!
//! ```yaml
//! providers:
//!   - name: fs
//!     command: fs-provider
//!     args: ["--root", "."]
//!     env:
//!       RUST_LOG: warn
//! client:
//!   requestTimeoutMs: 30000
//! manager:
//!   maxConnections: 4
//!   healthCheckIntervalMs: 0
//! engine:
//!   maxParallelSteps: 8
//! discovery:
//!   cacheTtlSecs: 3600
//!   filter:
//!     blockedTools: [delete_file]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manager::{ConnectionManager, ManagerConfig};
use crate::models::ProviderConfig;
use crate::protocol::discovery::{DiscoveryCache, DiscoveryConfig};
use crate::protocol::{ClientConfig, ProtocolClient};
use crate::workflow::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {message}")]
    Read { path: String, message: String },

    #[error("Invalid config: {0}")]
    Parse(String),

    #[error("Provider '{0}' is declared more than once")]
    DuplicateProvider(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolmeshConfig {
    pub providers: Vec<ProviderConfig>,
    pub client: ClientConfig,
    pub manager: ManagerConfig,
    pub engine: EngineConfig,
    pub discovery: DiscoveryConfig,
}

impl ToolmeshConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load by extension: `.json` is JSON, anything else YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// The discovery cache described by the `discovery` section, loaded from
    /// its persisted file when one exists. `None` when caching is disabled.
    pub fn discovery_cache(&self) -> Option<DiscoveryCache> {
        if self.discovery.cache_ttl_secs == 0 {
            return None;
        }
        let ttl = Duration::from_secs(self.discovery.cache_ttl_secs);
        let cache = match &self.discovery.cache_path {
            Some(path) if path.exists() => DiscoveryCache::load(path, ttl).unwrap_or_else(|e| {
                tracing::warn!(
                    "[Config] ignoring unreadable discovery cache {}: {}",
                    path.display(),
                    e
                );
                DiscoveryCache::new(ttl)
            }),
            _ => DiscoveryCache::new(ttl),
        };
        Some(cache)
    }

    /// A protocol client using this config's discovery settings. No provider
    /// is started until one is added.
    pub fn build_client(&self, cache: Option<DiscoveryCache>) -> ProtocolClient {
        ProtocolClient::with_discovery(self.client.clone(), cache, self.discovery.filter.clone())
    }

    /// Build a connection manager over a fresh protocol client and register
    /// every configured provider with it.
    pub async fn build_manager(&self, cache: Option<DiscoveryCache>) -> ConnectionManager {
        let manager = ConnectionManager::with_client(
            self.manager.clone(),
            self.client.clone(),
            cache,
            self.discovery.filter.clone(),
        );
        for provider in &self.providers {
            if let Err(e) = manager.register_provider(provider.clone()).await {
                tracing::warn!("[Config] {}", e);
            }
        }
        manager
    }

    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
        }
        Ok(())
    }
}
