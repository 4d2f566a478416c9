use serde::{Deserialize, Serialize};

use crate::tokens::TokenizerKind;

/// Token split across prompt lanes; `total` is the hard ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneBudgets {
    pub total: usize,
    pub summary: usize,
    pub intake: usize,
    pub hot_window: usize,
    pub viewport: usize,
    pub unit: usize,
    pub path: usize,
    pub concept: usize,
    pub user: usize,
    pub retrieval: usize,
    pub materials: usize,
    pub graph: usize,
}

impl Default for LaneBudgets {
    fn default() -> Self {
        Self {
            total: 24_000,
            summary: 1_500,
            intake: 800,
            hot_window: 6_000,
            viewport: 1_200,
            unit: 3_000,
            path: 1_500,
            concept: 1_200,
            user: 600,
            retrieval: 4_000,
            materials: 3_000,
            graph: 1_200,
        }
    }
}

/// Tunables for the context planner and retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Messages loaded for the hot window
    pub hot_window_load: usize,
    /// Tail of the loaded messages kept verbatim in the prompt
    pub hot_window_keep: usize,
    pub session_stale_secs: u64,
    pub router_timeout_ms: u64,
    pub router_min_confidence: f32,
    pub router_use_llm: bool,
    pub query_rewrite: bool,
    pub budgets: LaneBudgets,
    pub retrieval_per_scope: usize,
    pub rerank_enabled: bool,
    pub rerank_batch: usize,
    /// Rerank scores (0-100) below this are dropped
    pub rerank_floor: f32,
    pub mmr_lambda: f32,
    pub mmr_k: usize,
    pub vector_timeout_ms: u64,
    pub fts_fallback_limit: usize,
    pub materials_max: usize,
    pub materials_per_file: usize,
    pub materials_seed: usize,
    /// Concept docs older than this are rebuilt from canonical rows
    pub concept_doc_stale_secs: u64,
    pub tokenizer: TokenizerKind,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            hot_window_load: 30,
            hot_window_keep: 18,
            session_stale_secs: 90,
            router_timeout_ms: 5_000,
            router_min_confidence: 0.6,
            router_use_llm: true,
            query_rewrite: true,
            budgets: LaneBudgets::default(),
            retrieval_per_scope: 40,
            rerank_enabled: true,
            rerank_batch: 20,
            rerank_floor: 35.0,
            mmr_lambda: 0.5,
            mmr_k: 12,
            vector_timeout_ms: 2_000,
            fts_fallback_limit: 8,
            materials_max: 10,
            materials_per_file: 2,
            materials_seed: 24,
            concept_doc_stale_secs: 86_400,
            tokenizer: TokenizerKind::Chars,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ContextConfig::default();
        assert_eq!(cfg.hot_window_load, 30);
        assert_eq!(cfg.hot_window_keep, 18);
        assert_eq!(cfg.budgets.total, 24_000);
        assert_eq!(cfg.mmr_k, 12);
        assert!((cfg.router_min_confidence - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let cfg: ContextConfig =
            serde_json::from_value(serde_json::json!({"mmr_k": 6, "tokenizer": "cl100k"})).unwrap();
        assert_eq!(cfg.mmr_k, 6);
        assert_eq!(cfg.tokenizer, TokenizerKind::Cl100k);
        assert_eq!(cfg.retrieval_per_scope, 40);
    }
}
