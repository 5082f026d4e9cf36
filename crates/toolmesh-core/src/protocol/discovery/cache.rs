//! TTL cache of discovered tool lists, keyed by provider name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Tool;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    tools: Vec<Tool>,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn put(&self, provider: &str, tools: Vec<Tool>) {
        self.put_at(provider, tools, Utc::now());
    }

    pub fn put_at(&self, provider: &str, tools: Vec<Tool>, now: DateTime<Utc>) {
        self.lock().insert(
            provider.to_string(),
            CacheEntry {
                tools,
                cached_at: now,
            },
        );
    }

    pub fn get(&self, provider: &str) -> Option<Vec<Tool>> {
        self.get_at(provider, Utc::now())
    }

    /// Read as of `now`. An expired entry is a miss and is evicted.
    pub fn get_at(&self, provider: &str, now: DateTime<Utc>) -> Option<Vec<Tool>> {
        let mut entries = self.lock();
        let entry = entries.get(provider)?;
        if self.is_expired(entry, now) {
            tracing::debug!("[DiscoveryCache] Entry for {} expired", provider);
            entries.remove(provider);
            return None;
        }
        Some(entry.tools.clone())
    }

    pub fn remove(&self, provider: &str) -> bool {
        self.lock().remove(provider).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all entries to `path` as JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = self.lock().clone();
        let json = serde_json::to_string_pretty(&snapshot).map_err(std::io::Error::other)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }

    /// Load entries written by [`save`](Self::save). A missing file yields an
    /// empty cache; expired entries are dropped lazily on read.
    pub fn load(path: &Path, ttl: Duration) -> std::io::Result<Self> {
        let cache = Self::new(ttl);
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cache),
            Err(e) => return Err(e),
        };
        let entries: HashMap<String, CacheEntry> =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;
        *cache.lock() = entries;
        Ok(cache)
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.cached_at);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age > ttl,
            Err(_) => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
