//! Tool discovery policies layered on top of the raw `tools/list` result.
//!
//! - [`DiscoveryCache`] keeps discovery results per provider with a TTL.
//! - [`BatchedDiscovery`] streams a large tool set in bounded batches.
//! - [`ToolFilter`] hides tools by name, category or project context.

pub mod batch;
pub mod cache;
pub mod filter;

pub use batch::{BatchConfig, BatchedDiscovery, DiscoveryBatch};
pub use cache::{DiscoveryCache, DEFAULT_CACHE_TTL};
pub use filter::{ContextFilter, ToolCategory, ToolFilter};

use serde::{Deserialize, Serialize};

/// `discovery:` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Cache discovered tool lists; `0` disables the cache.
    pub cache_ttl_secs: u64,
    /// Where the CLI persists the cache between runs.
    pub cache_path: Option<std::path::PathBuf>,
    pub batch: BatchConfig,
    pub filter: ToolFilter,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            cache_path: None,
            batch: BatchConfig::default(),
            filter: ToolFilter::default(),
        }
    }
}
