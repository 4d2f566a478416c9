//! Hybrid retrieval over chat and path projections

mod materials;
mod mmr;
mod rerank;

pub use materials::{
    MaterialHit, MaterialQuery, MaterialRetriever, MaterialSearchMode, MaterialsResult, MaterialsTrace,
};
pub use mmr::mmr_select;
pub use rerank::{rerank, rerank_schema};

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lumen_llm::LlmClient;
use lumen_persist::{
    ChatDocRepository, MessageRepository, Stores, VectorFilter, VectorRecord, VectorStore,
};
use lumen_types::ids::{self, CHAT_DOC_VERSION};
use lumen_types::{ChatDoc, ChatMessage, DocType, Scope, Thread};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::filters;

/// Which scopes to search, plus the hot set to suppress
#[derive(Debug, Clone, Default)]
pub struct RetrievalPlan {
    pub scope_thread: bool,
    pub scope_path: bool,
    pub scope_user: bool,
    /// Active path; falls back to the thread's path
    pub path_id: Option<Uuid>,
    /// Message seqs already shown verbatim in the prompt
    pub hot_seqs: HashSet<i64>,
}

impl RetrievalPlan {
    pub fn is_empty(&self) -> bool {
        !(self.scope_thread || self.scope_path || self.scope_user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Vector search reranked by the model
    Hybrid,
    Vector,
    FullText,
    #[default]
    None,
}

#[derive(Debug, Clone)]
pub struct RetrievedDoc {
    pub doc: ChatDoc,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalTrace {
    pub query: String,
    pub scopes: Vec<String>,
    pub vector_hits: usize,
    pub fetched: usize,
    pub hot_set_dropped: usize,
    pub filtered_out: usize,
    pub reranked: bool,
    pub rerank_dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_error: Option<String>,
    pub fts_fallback: bool,
    pub selected: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub docs: Vec<RetrievedDoc>,
    pub mode: RetrievalMode,
    pub query_embedding: Vec<f32>,
    pub trace: RetrievalTrace,
}

/// Vector record for a projection row, carrying the metadata retrieval filters on
pub fn vector_record(doc: &ChatDoc) -> VectorRecord {
    let mut metadata = Map::new();
    metadata.insert("doc_type".into(), Value::from(doc.doc_type.as_str()));
    metadata.insert("scope".into(), Value::from(doc.scope.as_str()));
    if let Some(scope_id) = doc.scope_id {
        metadata.insert("scope_id".into(), Value::from(scope_id.to_string()));
    }
    if let Some(thread_id) = doc.thread_id {
        metadata.insert("thread_id".into(), Value::from(thread_id.to_string()));
    }
    if let Some(path_id) = doc.path_id {
        metadata.insert("path_id".into(), Value::from(path_id.to_string()));
    }
    VectorRecord {
        id: doc.vector_id.clone(),
        embedding: doc.embedding.clone(),
        metadata,
    }
}

fn scope_filter(scope: Scope, scope_id: Option<Uuid>) -> VectorFilter {
    let filter = VectorFilter::new().eq("scope", scope.as_str());
    match scope_id {
        Some(id) => filter.eq("scope_id", id.to_string()),
        None => filter,
    }
}

/// Score desc, then newer first, then id for stability
pub(crate) fn sort_candidates(docs: &mut [RetrievedDoc]) {
    docs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.doc.created_at.cmp(&a.doc.created_at))
            .then_with(|| a.doc.id.cmp(&b.doc.id))
    });
}

/// MMR pick over score-sorted candidates, returned in pick order
fn diversify(candidates: Vec<RetrievedDoc>, lambda: f32, k: usize) -> Vec<RetrievedDoc> {
    let items: Vec<(f32, &[f32])> = candidates
        .iter()
        .map(|d| (d.score, d.doc.embedding.as_slice()))
        .collect();
    let picked = mmr_select(&items, lambda, k);
    let mut slots: Vec<Option<RetrievedDoc>> = candidates.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|idx| slots.get_mut(idx).and_then(Option::take))
        .collect()
}

/// Canonical message as a transient projection row, for the full-text fallback
fn message_as_doc(message: &ChatMessage) -> ChatDoc {
    let mut doc = ChatDoc::projected(
        message.user_id,
        DocType::MessageChunk,
        Scope::Thread,
        Some(message.thread_id),
        message.id,
        0,
        CHAT_DOC_VERSION,
        message.content.clone(),
    )
    .in_thread(message.thread_id)
    .at_seq(message.seq);
    doc.created_at = message.created_at;
    doc
}

pub struct HybridRetriever {
    docs: Arc<dyn ChatDocRepository>,
    messages: Arc<dyn MessageRepository>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    config: ContextConfig,
    rerank_model: Option<String>,
}

impl HybridRetriever {
    pub fn new(stores: &Stores, llm: Arc<dyn LlmClient>, config: ContextConfig) -> Self {
        Self {
            docs: stores.docs.clone(),
            messages: stores.messages.clone(),
            vectors: stores.vectors.clone(),
            llm,
            config,
            rerank_model: None,
        }
    }

    pub fn with_rerank_model(mut self, model: impl Into<String>) -> Self {
        self.rerank_model = Some(model.into());
        self
    }

    pub async fn retrieve(
        &self,
        thread: &Thread,
        query: &str,
        plan: &RetrievalPlan,
    ) -> Result<RetrievalResult> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ContextError::InputInvalid("retrieval query is empty".into()));
        }
        let mut trace = RetrievalTrace {
            query: query.to_string(),
            ..Default::default()
        };

        let query_embedding = self.embed_query(query, &mut trace).await;

        let mut candidates = Vec::new();
        if !query_embedding.is_empty() && !plan.is_empty() {
            let hits = self.vector_hits(thread, plan, &query_embedding, &mut trace).await;
            candidates = self.hydrate(thread.user_id, hits).await?;
            trace.fetched = candidates.len();
        }

        let before = candidates.len();
        candidates.retain(|d| !in_hot_set(&d.doc, &plan.hot_seqs));
        trace.hot_set_dropped = before - candidates.len();

        let before = candidates.len();
        candidates.retain(|d| filters::admit(d.doc.retrieval_text(), query));
        trace.filtered_out = before - candidates.len();

        sort_candidates(&mut candidates);

        let mut mode = if candidates.is_empty() {
            RetrievalMode::None
        } else {
            RetrievalMode::Vector
        };

        if self.config.rerank_enabled && candidates.len() > 1 {
            if self.apply_rerank(query, &mut candidates, &mut trace).await {
                mode = RetrievalMode::Hybrid;
            }
        }

        // selection order is the MMR order and is not re-sorted by score
        let mut docs = diversify(candidates, self.config.mmr_lambda, self.config.mmr_k);

        if docs.is_empty() {
            mode = RetrievalMode::None;
            docs = self.full_text_fallback(thread, query, plan).await?;
            if !docs.is_empty() {
                mode = RetrievalMode::FullText;
                trace.fts_fallback = true;
                sort_candidates(&mut docs);
            }
        }

        trace.selected = docs.iter().map(|d| d.doc.id.to_string()).collect();
        debug!(
            thread_id = %thread.id,
            mode = ?mode,
            selected = docs.len(),
            "retrieval finished"
        );

        Ok(RetrievalResult {
            docs,
            mode,
            query_embedding,
            trace,
        })
    }

    async fn embed_query(&self, query: &str, trace: &mut RetrievalTrace) -> Vec<f32> {
        match self.llm.embed(&[query.to_string()]).await {
            Ok(mut vectors) if vectors.first().map(|v| !v.is_empty()).unwrap_or(false) => {
                vectors.swap_remove(0)
            }
            Ok(_) => {
                trace.embed_error = Some("provider returned no embedding".into());
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "query embedding failed; skipping vector search");
                trace.embed_error = Some(e.to_string());
                Vec::new()
            }
        }
    }

    /// Per-scope vector queries, merged by best score
    async fn vector_hits(
        &self,
        thread: &Thread,
        plan: &RetrievalPlan,
        embedding: &[f32],
        trace: &mut RetrievalTrace,
    ) -> HashMap<Uuid, f32> {
        let namespace = ids::user_namespace(thread.user_id);
        let path_id = plan.path_id.or(thread.path_id);

        let mut scopes = Vec::new();
        if plan.scope_thread {
            scopes.push((Scope::Thread, Some(thread.id)));
        }
        if plan.scope_path {
            if let Some(path_id) = path_id {
                scopes.push((Scope::Path, Some(path_id)));
            }
        }
        if plan.scope_user {
            scopes.push((Scope::User, None));
        }

        let timeout = Duration::from_millis(self.config.vector_timeout_ms);
        let mut hits: HashMap<Uuid, f32> = HashMap::new();
        for (scope, scope_id) in scopes {
            trace.scopes.push(scope.as_str().to_string());
            let filter = scope_filter(scope, scope_id);
            let query = self.vectors.query_matches(
                &namespace,
                embedding,
                self.config.retrieval_per_scope,
                &filter,
            );
            let matches = match tokio::time::timeout(timeout, query).await {
                Ok(Ok(matches)) => matches,
                Ok(Err(e)) => {
                    warn!(scope = scope.as_str(), error = %e, "vector query failed");
                    continue;
                }
                Err(_) => {
                    warn!(scope = scope.as_str(), timeout_ms = self.config.vector_timeout_ms, "vector query timed out");
                    continue;
                }
            };
            for m in matches {
                if let Some(doc_id) = ids::doc_id_from_vector_id(&m.id) {
                    trace.vector_hits += 1;
                    let slot = hits.entry(doc_id).or_insert(m.score);
                    *slot = slot.max(m.score);
                }
            }
        }
        hits
    }

    /// Load backing rows; the repository re-checks ownership by user
    async fn hydrate(&self, user_id: Uuid, hits: HashMap<Uuid, f32>) -> Result<Vec<RetrievedDoc>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = hits.keys().copied().collect();
        let rows = self.docs.get_docs(user_id, &ids).await?;
        Ok(rows
            .into_iter()
            .filter(|doc| doc.user_id == user_id)
            .filter_map(|doc| {
                let score = *hits.get(&doc.id)?;
                Some(RetrievedDoc { doc, score })
            })
            .collect())
    }

    /// Returns true when rerank scores replaced the vector scores
    async fn apply_rerank(
        &self,
        query: &str,
        candidates: &mut Vec<RetrievedDoc>,
        trace: &mut RetrievalTrace,
    ) -> bool {
        let inputs: Vec<(String, String)> = candidates
            .iter()
            .map(|d| (d.doc.id.to_string(), d.doc.retrieval_text().to_string()))
            .collect();
        let scores = match rerank(
            self.llm.as_ref(),
            query,
            &inputs,
            self.config.rerank_batch,
            self.rerank_model.as_deref(),
        )
        .await
        {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "rerank failed; keeping vector scores");
                trace.rerank_error = Some(e.to_string());
                return false;
            }
        };

        let floor = self.config.rerank_floor;
        let before = candidates.len();
        candidates.retain_mut(|d| match scores.get(&d.doc.id.to_string()) {
            Some(score) if *score >= floor => {
                d.score = *score / 100.0;
                true
            }
            _ => false,
        });
        trace.reranked = true;
        trace.rerank_dropped = before - candidates.len();
        sort_candidates(candidates);
        true
    }

    async fn full_text_fallback(
        &self,
        thread: &Thread,
        query: &str,
        plan: &RetrievalPlan,
    ) -> Result<Vec<RetrievedDoc>> {
        let hits = self
            .messages
            .search_messages(thread.id, query, self.config.fts_fallback_limit)
            .await?;
        Ok(hits
            .into_iter()
            .filter(|(m, _)| m.user_id == thread.user_id && !plan.hot_seqs.contains(&m.seq))
            .filter(|(m, _)| filters::admit(&m.content, query))
            .map(|(m, score)| RetrievedDoc {
                doc: message_as_doc(&m),
                score,
            })
            .collect())
    }
}

fn in_hot_set(doc: &ChatDoc, hot_seqs: &HashSet<i64>) -> bool {
    doc.doc_type == DocType::MessageChunk
        && doc.source_seq.map(|seq| hot_seqs.contains(&seq)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn doc(score: f32, age_secs: i64) -> RetrievedDoc {
        let mut doc = ChatDoc::projected(
            Uuid::new_v4(),
            DocType::Summary,
            Scope::Thread,
            None,
            Uuid::new_v4(),
            0,
            CHAT_DOC_VERSION,
            "text",
        );
        doc.created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        RetrievedDoc { doc, score }
    }

    #[test]
    fn test_sort_breaks_ties_by_recency() {
        let older = doc(0.5, 100);
        let newer = doc(0.5, 1);
        let best = doc(0.9, 1000);
        let mut docs = vec![older.clone(), newer.clone(), best.clone()];
        sort_candidates(&mut docs);
        assert_eq!(docs[0].doc.id, best.doc.id);
        assert_eq!(docs[1].doc.id, newer.doc.id);
        assert_eq!(docs[2].doc.id, older.doc.id);
    }

    fn embedded(score: f32, embedding: Vec<f32>) -> RetrievedDoc {
        let mut d = doc(score, 10);
        d.doc.embedding = embedding;
        d
    }

    #[test]
    fn test_diversify_keeps_pick_order() {
        let top = embedded(0.9, vec![1.0, 0.0, 0.0]);
        let twin = embedded(0.88, vec![1.0, 0.0, 0.0]);
        let near = embedded(0.7, vec![1.0, 1.0, 0.0]);
        let far = embedded(0.5, vec![0.0, 0.0, 1.0]);
        let mut candidates = vec![far.clone(), near.clone(), twin.clone(), top.clone()];
        sort_candidates(&mut candidates);

        let picked: Vec<Uuid> = diversify(candidates, 0.5, 3).into_iter().map(|d| d.doc.id).collect();
        // the distant doc is picked second even though it scores lowest
        assert_eq!(picked, vec![top.doc.id, far.doc.id, near.doc.id]);
    }

    #[test]
    fn test_vector_record_metadata() {
        let thread = Uuid::new_v4();
        let d = ChatDoc::projected(
            Uuid::new_v4(),
            DocType::MessageChunk,
            Scope::Thread,
            Some(thread),
            Uuid::new_v4(),
            1,
            CHAT_DOC_VERSION,
            "hello",
        )
        .in_thread(thread);
        let record = vector_record(&d);
        assert_eq!(record.id, d.vector_id);
        assert_eq!(record.metadata["scope"], "thread");
        assert_eq!(record.metadata["scope_id"], thread.to_string());
        assert!(scope_filter(Scope::Thread, Some(thread)).matches(&record.metadata));
        assert!(!scope_filter(Scope::Path, Some(thread)).matches(&record.metadata));
    }

    #[test]
    fn test_hot_set_only_applies_to_message_chunks() {
        let hot: HashSet<i64> = [3, 4].into_iter().collect();
        let chunk = ChatDoc::projected(
            Uuid::new_v4(),
            DocType::MessageChunk,
            Scope::Thread,
            None,
            Uuid::new_v4(),
            0,
            CHAT_DOC_VERSION,
            "x",
        )
        .at_seq(3);
        let mut summary = chunk.clone();
        summary.doc_type = DocType::Summary;
        assert!(in_hot_set(&chunk, &hot));
        assert!(!in_hot_set(&summary, &hot));
    }
}
