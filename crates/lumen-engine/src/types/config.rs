use lumen_context::ContextConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every engine tunable; maps onto the `[engine]` config section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub context: ContextConfig,
    pub responder: ResponderConfig,
    pub notifier: NotifierConfig,
    pub maintainer: MaintainerConfig,
    pub jobs: JobConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_models(mut self, chat: impl Into<String>, fast: impl Into<String>) -> Self {
        self.responder.chat_model = Some(chat.into());
        self.responder.fast_model = Some(fast.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Main answer model; provider default when unset
    pub chat_model: Option<String>,
    /// Small-talk, routing, rerank and repair model
    pub fast_model: Option<String>,
    pub db_flush_ms: u64,
    pub db_flush_chars: usize,
    pub sse_flush_ms: u64,
    pub sse_flush_bytes: usize,
    /// Keep a provider conversation handle per thread
    pub use_conversation: bool,
    pub tool_routing: bool,
    pub router_timeout_ms: u64,
    /// Quoted spans shorter than this are not verified
    pub quote_min_chars: usize,
    pub quote_repair: bool,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            chat_model: None,
            fast_model: None,
            db_flush_ms: 750,
            db_flush_chars: 256,
            sse_flush_ms: 150,
            sse_flush_bytes: 512,
            use_conversation: true,
            tool_routing: true,
            router_timeout_ms: 5_000,
            quote_min_chars: 6,
            quote_repair: true,
            temperature: None,
            max_output_tokens: None,
        }
    }
}

impl ResponderConfig {
    pub fn db_flush_interval(&self) -> Duration {
        Duration::from_millis(self.db_flush_ms)
    }

    pub fn sse_flush_interval(&self) -> Duration {
        Duration::from_millis(self.sse_flush_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Per-subscriber queue length before deltas are shed
    pub subscriber_buffer: usize,
    pub keepalive_secs: u64,
    /// Capacity of the cross-node broadcast bus; 0 disables it
    pub bus_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            keepalive_secs: 15,
            bus_capacity: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintainerConfig {
    pub chunk_chars: usize,
    pub index_concurrency: usize,
    /// Inputs per embeddings request
    pub embed_batch: usize,
    /// Messages per RAPTOR leaf
    pub leaf_window: usize,
    /// Target children per parent when clustering
    pub cluster_fan_in: usize,
    pub kmeans_iters: usize,
    /// Messages per graph or memory extraction call
    pub extract_window: usize,
    pub contextualize: bool,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            chunk_chars: 2_200,
            index_concurrency: 8,
            embed_batch: 96,
            leaf_window: 20,
            cluster_fan_in: 8,
            kmeans_iters: 10,
            extract_window: 40,
            contextualize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 500,
            lease_secs: 300,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl JobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_tunables() {
        let config = EngineConfig::default();
        assert_eq!(config.context.hot_window_load, 30);
        assert_eq!(config.context.hot_window_keep, 18);
        assert_eq!(config.context.budgets.total, 24_000);
        assert_eq!(config.responder.db_flush_ms, 750);
        assert_eq!(config.responder.db_flush_chars, 256);
        assert_eq!(config.responder.sse_flush_ms, 150);
        assert_eq!(config.responder.sse_flush_bytes, 512);
        assert_eq!(config.notifier.keepalive_secs, 15);
        assert_eq!(config.maintainer.chunk_chars, 2_200);
        assert_eq!(config.maintainer.leaf_window, 20);
        assert_eq!(config.maintainer.cluster_fan_in, 8);
        assert_eq!(config.maintainer.index_concurrency, 8);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [responder]
            chat_model = "gpt-4o"
            db_flush_ms = 500

            [context]
            mmr_k = 6

            [jobs]
            workers = 4
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.responder.chat_model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.responder.db_flush_ms, 500);
        assert_eq!(config.responder.sse_flush_ms, 150);
        assert_eq!(config.context.mmr_k, 6);
        assert_eq!(config.context.hot_window_keep, 18);
        assert_eq!(config.jobs.workers, 4);
        assert_eq!(config.maintainer, MaintainerConfig::default());
    }
}
