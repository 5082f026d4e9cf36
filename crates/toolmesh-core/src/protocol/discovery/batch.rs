//! Batched tool discovery.
//!
//! Large providers can advertise hundreds of tools. Rather than handing a
//! consumer one huge burst, the tool set is split into fixed-size batches
//! (priority-keyword matches first) and streamed through a bounded channel:
//! at most `max_concurrent_batches` are in flight, and the producer pauses
//! for `batch_delay_ms` between groups.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::models::ProviderTool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub batch_delay_ms: u64,
    /// Tools matching an earlier keyword sort before later ones.
    pub priority_keywords: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_batches: 3,
            batch_delay_ms: 100,
            priority_keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryBatch {
    /// Zero-based position of this batch.
    pub index: usize,
    pub total: usize,
    pub tools: Vec<ProviderTool>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchedDiscovery {
    config: BatchConfig,
}

impl BatchedDiscovery {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Stable reorder: tools matching a priority keyword first.
    pub fn prioritize(&self, mut tools: Vec<ProviderTool>) -> Vec<ProviderTool> {
        if self.config.priority_keywords.is_empty() {
            return tools;
        }
        let keywords: Vec<String> = self
            .config
            .priority_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .collect();
        tools.sort_by_cached_key(|pt| {
            let text = pt.tool.search_text();
            keywords
                .iter()
                .position(|k| text.contains(k.as_str()))
                .unwrap_or(keywords.len())
        });
        tools
    }

    pub fn plan(&self, tools: Vec<ProviderTool>) -> Vec<DiscoveryBatch> {
        let size = self.config.batch_size.max(1);
        let tools = self.prioritize(tools);
        let total = tools.len().div_ceil(size);
        tools
            .chunks(size)
            .enumerate()
            .map(|(index, chunk)| DiscoveryBatch {
                index,
                total,
                tools: chunk.to_vec(),
            })
            .collect()
    }

    /// Stream the batches. Must be called inside a tokio runtime.
    pub fn stream(&self, tools: Vec<ProviderTool>) -> ReceiverStream<DiscoveryBatch> {
        let in_flight = self.config.max_concurrent_batches.max(1);
        let delay = Duration::from_millis(self.config.batch_delay_ms);
        let batches = self.plan(tools);
        let (tx, rx) = mpsc::channel(in_flight);

        tokio::spawn(async move {
            for batch in batches {
                if batch.index > 0 && batch.index % in_flight == 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(batch).await.is_err() {
                    tracing::debug!("[BatchedDiscovery] Consumer dropped the stream");
                    break;
                }
            }
        });

        ReceiverStream::new(rx)
    }
}
