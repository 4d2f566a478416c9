//! Per-thread background maintenance
//!
//! Four phases each own one cursor in `ThreadState`. A phase reads the
//! messages above its cursor, writes derived rows under deterministic ids and
//! reports how far it got; the maintainer then raises the cursor with a
//! monotonic store update. Model failures inside a phase are logged and the
//! window is still consumed.

mod graph;
mod index;
pub mod kmeans;
mod memory;
mod mirror;
mod raptor;

pub use graph::GraphPhase;
pub use index::{chunk_text, IndexPhase};
pub use memory::MemoryPhase;
pub use mirror::{spawn_mirror, GraphMirror, GraphSnapshot, NoopGraphMirror};
pub use raptor::SummaryPhase;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lumen_context::retriever::vector_record;
use lumen_llm::{GenerateOptions, JsonRequest, JsonSchema, LlmClient};
use lumen_persist::Stores;
use lumen_types::ids;
use lumen_types::{ChatDoc, ChatMessage, Cursor, DocType, MessageStatus, Scope, Thread};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::types::MaintainerConfig;

/// Everything a phase needs for one thread
pub struct PhaseContext {
    pub thread: Thread,
    pub stores: Stores,
    pub llm: Arc<dyn LlmClient>,
    pub config: MaintainerConfig,
    pub model: Option<String>,
    pub cancel: CancelToken,
}

impl PhaseContext {
    pub fn user_id(&self) -> Uuid {
        self.thread.user_id
    }

    fn options(&self) -> GenerateOptions {
        let options = GenerateOptions::new().temperature(0.0);
        match &self.model {
            Some(model) => options.model(model.clone()),
            None => options,
        }
    }

    pub async fn generate_json(&self, system: &str, user: String, schema: JsonSchema) -> lumen_llm::Result<Value> {
        let request = JsonRequest::new(system, user, schema).with_options(self.options());
        self.llm.generate_json(request).await
    }

    /// Embed `docs` in place, `embed_batch` inputs per request; a failed batch leaves its embeddings empty
    pub async fn embed_docs(&self, docs: &mut [ChatDoc]) -> usize {
        if docs.is_empty() {
            return 0;
        }
        let batch = self.config.embed_batch.max(1);
        let batches: Vec<_> = docs.chunks_mut(batch).map(|chunk| self.embed_batch(chunk)).collect();
        stream::iter(batches)
            .buffer_unordered(self.config.index_concurrency.max(1))
            .fold(0, |missing, n| async move { missing + n })
            .await
    }

    async fn embed_batch(&self, docs: &mut [ChatDoc]) -> usize {
        let inputs: Vec<String> = docs.iter().map(|d| d.retrieval_text().to_string()).collect();
        match self.llm.embed(&inputs).await {
            Ok(vectors) => {
                let mut missing = 0;
                for (idx, doc) in docs.iter_mut().enumerate() {
                    match vectors.get(idx) {
                        Some(v) if !v.is_empty() => doc.embedding = v.clone(),
                        _ => missing += 1,
                    }
                }
                missing
            }
            Err(e) => {
                warn!(thread_id = %self.thread.id, docs = docs.len(), error = %e, "embedding batch failed");
                docs.len()
            }
        }
    }

    /// Write rows, then their vectors; rows without an embedding stay out of the index
    pub async fn project(&self, docs: Vec<ChatDoc>) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let records: Vec<_> = docs
            .iter()
            .filter(|d| !d.embedding.is_empty())
            .map(vector_record)
            .collect();
        let written = docs.len();
        self.stores.docs.upsert_docs(docs).await?;
        if !records.is_empty() {
            self.stores
                .vectors
                .upsert(&ids::user_namespace(self.user_id()), records)
                .await?;
        }
        Ok(written)
    }

    /// Messages above `cursor` that are final, plus the seq the phase may advance to
    pub async fn window(&self, cursor: i64) -> Result<Window> {
        let upper = self.thread.next_seq - 1;
        if upper <= cursor {
            return Ok(Window {
                messages: Vec::new(),
                up_to: cursor,
            });
        }
        let mut messages = self
            .stores
            .messages
            .list_range(self.thread.id, cursor, upper)
            .await?;
        let up_to = match messages.iter().position(|m| m.status == MessageStatus::Streaming) {
            Some(idx) => {
                let stop = messages[idx].seq - 1;
                messages.truncate(idx);
                stop
            }
            None => upper,
        };
        Ok(Window { messages, up_to })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Window {
    pub messages: Vec<ChatMessage>,
    /// Highest seq the phase may claim once it has processed `messages`
    pub up_to: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseOutcome {
    /// Cursor value to store
    pub up_to: i64,
    pub written: usize,
    /// Windows or items whose model call failed and were skipped
    pub skipped: usize,
}

/// One cursor-owning stage of the maintenance pipeline
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &'static str;

    fn cursor(&self) -> Cursor;

    async fn run(&self, ctx: &PhaseContext, cursor: i64) -> Result<PhaseOutcome>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: &'static str,
    pub cursor_before: i64,
    pub cursor_after: i64,
    pub written: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintainReport {
    pub thread_id: Uuid,
    pub phases: Vec<PhaseReport>,
}

impl MaintainReport {
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == name)
    }
}

pub struct Maintainer {
    stores: Stores,
    llm: Arc<dyn LlmClient>,
    config: MaintainerConfig,
    model: Option<String>,
    phases: Vec<Arc<dyn Phase>>,
    mirror: Arc<dyn GraphMirror>,
}

impl Maintainer {
    pub fn new(stores: Stores, llm: Arc<dyn LlmClient>, config: MaintainerConfig) -> Self {
        Self {
            stores,
            llm,
            config,
            model: None,
            phases: vec![
                Arc::new(IndexPhase),
                Arc::new(SummaryPhase),
                Arc::new(GraphPhase),
                Arc::new(MemoryPhase),
            ],
            mirror: Arc::new(NoopGraphMirror),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn GraphMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    #[instrument(skip(self, cancel), fields(thread_id = %thread_id))]
    pub async fn maintain(&self, thread_id: Uuid, cancel: CancelToken) -> Result<MaintainReport> {
        let thread = self
            .stores
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| EngineError::not_found("thread", thread_id))?;
        let mut state = self.stores.thread_state.ensure_state(thread_id).await?;

        let ctx = PhaseContext {
            thread,
            stores: self.stores.clone(),
            llm: self.llm.clone(),
            config: self.config.clone(),
            model: self.model.clone(),
            cancel,
        };

        let mut report = MaintainReport {
            thread_id,
            phases: Vec::with_capacity(self.phases.len()),
        };
        for phase in &self.phases {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let before = state.cursor(phase.cursor());
            let outcome = phase.run(&ctx, before).await?;
            let after = if outcome.up_to > before {
                let stored = self
                    .stores
                    .thread_state
                    .advance_cursor_in_epoch(thread_id, state.epoch, phase.cursor(), outcome.up_to)
                    .await?;
                match stored {
                    Some(stored) => state.advance(phase.cursor(), stored),
                    None => {
                        // a rebuild reset the cursors mid-pass and owns the thread now
                        info!(phase = phase.name(), epoch = state.epoch, "maintenance superseded by rebuild");
                        return Ok(report);
                    }
                }
            } else {
                before
            };
            debug!(
                phase = phase.name(),
                cursor_before = before,
                cursor_after = after,
                written = outcome.written,
                skipped = outcome.skipped,
                "phase finished"
            );
            report.phases.push(PhaseReport {
                phase: phase.name(),
                cursor_before: before,
                cursor_after: after,
                written: outcome.written,
                skipped: outcome.skipped,
            });
        }

        let graph_advanced = report
            .phase(GraphPhase.name())
            .map(|p| p.cursor_after > p.cursor_before)
            .unwrap_or(false);
        if graph_advanced && self.mirror.enabled() {
            match GraphSnapshot::load(&self.stores, &ctx.thread).await {
                Ok(snapshot) => {
                    spawn_mirror(self.mirror.clone(), snapshot);
                }
                Err(e) => warn!(error = %e, "could not load chat graph for mirroring"),
            }
        }

        info!(
            phases = report.phases.len(),
            written = report.phases.iter().map(|p| p.written).sum::<usize>(),
            "thread maintained"
        );
        Ok(report)
    }

    /// Drop every derived row of the thread and rebuild from the message log
    #[instrument(skip(self, cancel), fields(thread_id = %thread_id))]
    pub async fn rebuild(&self, thread_id: Uuid, cancel: CancelToken) -> Result<MaintainReport> {
        let thread = self
            .stores
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| EngineError::not_found("thread", thread_id))?;
        let user_id = thread.user_id;

        let removed = self
            .stores
            .docs
            .delete_thread_docs(thread_id, &DocType::THREAD_DERIVED)
            .await?;
        let vector_ids: Vec<String> = removed.iter().map(|d| d.vector_id.clone()).collect();
        if !vector_ids.is_empty() {
            self.stores
                .vectors
                .delete_ids(&ids::user_namespace(user_id), &vector_ids)
                .await?;
        }
        let nodes = self.stores.summaries.delete_nodes(thread_id).await?;
        self.stores
            .graph
            .delete_graph(user_id, Scope::Thread, Some(thread_id))
            .await?;
        let items = self
            .stores
            .memory
            .delete_items(user_id, Scope::Thread, Some(thread_id))
            .await?;
        let epoch = self.stores.thread_state.reset_cursors(thread_id).await?;
        info!(
            epoch,
            docs = removed.len(),
            summary_nodes = nodes,
            memory_items = items,
            "thread derived state cleared"
        );

        self.maintain(thread_id, cancel).await
    }
}

/// Transcript lines used as model input, `#seq role: content`
pub(crate) fn transcript(messages: &[ChatMessage], max_chars: usize) -> String {
    let mut out = String::new();
    for m in messages {
        let content = truncate_chars(m.content.trim(), max_chars);
        out.push_str(&format!("#{} {}: {}\n", m.seq, m.role.as_str(), content));
    }
    out
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Keep only evidence seqs that fall inside the processed window
pub(crate) fn evidence_in(values: Option<&Value>, window: &[ChatMessage]) -> Vec<i64> {
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return Vec::new();
    };
    let mut seqs: Vec<i64> = values
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    seqs.retain(|s| *s >= first.seq && *s <= last.seq);
    seqs.sort_unstable();
    seqs.dedup();
    seqs
}
