//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses the
//! toolmesh-core components through a short-lived [`Session`].

pub mod call;
pub mod tools;
pub mod workflow;

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use toolmesh_core::protocol::discovery::DiscoveryCache;
use toolmesh_core::{ConnectionManager, ToolmeshConfig};

/// `<config dir>/toolmesh/config.yaml`, or `toolmesh.yaml` in the working
/// directory when the platform has no config dir.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("toolmesh").join("config.yaml"))
        .unwrap_or_else(|| PathBuf::from("toolmesh.yaml"))
}

/// Load the config file. A missing file at the default location means an
/// empty config; a missing file that was asked for explicitly is an error.
pub fn load_config(path: &Path, explicit: bool) -> Result<ToolmeshConfig, String> {
    if !path.exists() && !explicit {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(ToolmeshConfig::default());
    }
    ToolmeshConfig::from_file(path).map_err(|e| e.to_string())
}

/// A connection manager with every configured provider connected, plus the
/// discovery cache it fills so it can be persisted on close.
pub struct Session {
    pub manager: ConnectionManager,
    cache: Option<DiscoveryCache>,
    cache_path: Option<PathBuf>,
}

impl Session {
    pub async fn open(config: &ToolmeshConfig) -> Self {
        let cache = config.discovery_cache();
        let manager = config.build_manager(cache.clone()).await;
        manager.start();

        let names: Vec<String> = config.providers.iter().map(|p| p.name.clone()).collect();
        for (name, result) in manager.connect_multiple(names).await {
            match result {
                Ok(tools) => tracing::info!("Connected to {} ({} tools)", name, tools.len()),
                Err(e) => eprintln!(
                    "{} {}: {}",
                    console::style("warning:").yellow().bold(),
                    name,
                    e
                ),
            }
        }

        Self {
            manager,
            cache,
            cache_path: config.discovery.cache_path.clone(),
        }
    }

    /// Persist the discovery cache and stop every provider.
    pub async fn close(self) {
        if let (Some(cache), Some(path)) = (&self.cache, &self.cache_path) {
            if let Err(e) = cache.save(path) {
                tracing::warn!("Failed to save discovery cache {}: {}", path.display(), e);
            }
        }
        self.manager.shutdown().await;
    }
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type;
/// anything else is taken as a plain string.
pub fn parse_inputs(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut inputs = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(format!("Invalid input '{}': expected key=value", pair));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid input '{}': empty key", pair));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
