//! Per-turn context planning
//!
//! The planner turns one user message into a single instruction string built
//! from labeled lanes of evidence (hot window, summaries, the live unit, path
//! outline, concepts, learner state, retrieved docs, source excerpts and the
//! chat graph), each trimmed to a token budget. The new user message is never
//! part of the instructions; it travels separately as `user_payload`.

mod budget;
mod edit;
mod render;
mod router;
mod session;

pub use budget::{allocate, Allocation, Lane};
pub use edit::{resolve_edit_target, EditTarget, EditTargetSource};
pub use render::LaneUsage;
pub use router::{
    enforce, heuristic_route, refine_route, route_schema, BlockDetail, Lanes, PlanMode,
    RetrievalScopes, RouteContext, RouteDecision, RouteSource, UnitDetail,
};
pub use session::{merge_session, message_session, SessionSnapshot};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lumen_llm::{GenerateOptions, JsonRequest, JsonSchema, LlmClient};
use lumen_persist::Stores;
use lumen_types::ids::{self, CHAT_PATH_DOC_VERSION};
use lumen_types::{
    ChatDoc, ChatMessage, DocType, EvidenceKind, EvidenceSource, LearningPath, MemoryKind,
    NodeDoc, Scope, SummaryNode, Thread, ThreadState,
};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::path_docs::{self, block_marker, parse_block_marker, PathSnapshot};
use crate::prompts::{
    ASSISTANT_BASE_PROMPT, EDIT_MODE_PROMPT, INSTRUCTION_FIREWALL, QUERY_REWRITE_SYSTEM_PROMPT,
};
use crate::retriever::{
    HybridRetriever, MaterialHit, MaterialQuery, MaterialRetriever, RetrievalMode, RetrievalPlan,
    RetrievalResult,
};
use crate::tokens::TokenEstimator;
use render::{hot_window_items, LaneItem, PromptBuilder};

/// Metadata `kind` of the message holding a build job's intake questions
pub const INTAKE_QUESTIONS_KIND: &str = "path_intake_questions";

const BLOCK_SUMMARY_CHARS: usize = 600;
const VISIBLE_BLOCK_CHARS: usize = 300;
const GRAPH_ENTITIES: usize = 25;
const GRAPH_CLAIMS: usize = 15;
const REWRITE_TURNS: usize = 6;
const REWRITE_TURN_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct PlanInput {
    pub user_id: Uuid,
    pub thread: Thread,
    pub state: ThreadState,
    pub user_text: String,
    pub user_message: ChatMessage,
}

#[derive(Debug, Clone)]
pub struct ContextPlan {
    pub instructions: String,
    pub user_payload: String,
    pub used_docs: Vec<ChatDoc>,
    pub evidence_sources: Vec<EvidenceSource>,
    pub retrieval_mode: RetrievalMode,
    pub edit_target: Option<EditTarget>,
    pub mode: PlanMode,
    pub route: RouteDecision,
    pub trace: Value,
}

impl ContextPlan {
    /// The learner asked for verbatim source text but no excerpt made it into context
    pub fn missing_material_quotes(&self) -> bool {
        self.route.verbatim && !self.evidence_sources.iter().any(|s| s.is_material())
    }
}

/// Builds the prompt context for a product-lane turn
#[async_trait]
pub trait ContextPlanner: Send + Sync {
    async fn plan(&self, input: PlanInput) -> Result<ContextPlan>;
}

pub struct DefaultContextPlanner {
    stores: Stores,
    llm: Arc<dyn LlmClient>,
    retriever: HybridRetriever,
    materials: MaterialRetriever,
    tokens: Arc<dyn TokenEstimator>,
    config: ContextConfig,
    fast_model: Option<String>,
}

impl DefaultContextPlanner {
    pub fn new(stores: Stores, llm: Arc<dyn LlmClient>, config: ContextConfig) -> Result<Self> {
        let tokens = config.tokenizer.build()?;
        Ok(Self::with_estimator(stores, llm, config, tokens))
    }

    pub fn with_estimator(
        stores: Stores,
        llm: Arc<dyn LlmClient>,
        config: ContextConfig,
        tokens: Arc<dyn TokenEstimator>,
    ) -> Self {
        let retriever = HybridRetriever::new(&stores, llm.clone(), config.clone());
        let materials = MaterialRetriever::new(stores.paths.clone(), stores.vectors.clone(), config.clone());
        Self {
            stores,
            llm,
            retriever,
            materials,
            tokens,
            config,
            fast_model: None,
        }
    }

    /// Model used for routing, query rewrite and rerank
    pub fn with_fast_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.retriever = self.retriever.with_rerank_model(model.clone());
        self.fast_model = Some(model);
        self
    }

    fn fast_options(&self) -> GenerateOptions {
        let options = GenerateOptions::new().temperature(0.0);
        match &self.fast_model {
            Some(model) => options.model(model.clone()),
            None => options,
        }
    }

    /// Tail of the thread before the new user message
    async fn hot_window(&self, thread: &Thread, user_message: &ChatMessage) -> Result<Vec<ChatMessage>> {
        let recent = self
            .stores
            .messages
            .list_recent(thread.id, self.config.hot_window_load)
            .await?;
        let prior: Vec<ChatMessage> = recent
            .into_iter()
            .filter(|m| m.seq < user_message.seq && m.id != user_message.id)
            .collect();
        let keep_from = prior.len().saturating_sub(self.config.hot_window_keep);
        Ok(prior[keep_from..].to_vec())
    }

    async fn owned_path(&self, user_id: Uuid, path_id: Option<Uuid>) -> Result<Option<LearningPath>> {
        let Some(path_id) = path_id else {
            return Ok(None);
        };
        Ok(self
            .stores
            .paths
            .get_path(path_id)
            .await?
            .filter(|p| p.user_id == user_id))
    }

    /// Intake questions of a build job parked at a waitpoint, unless already in the hot window
    async fn intake_pin(&self, thread: &Thread, hot_seqs: &HashSet<i64>) -> Option<ChatMessage> {
        let job_id = thread.job_id?;
        let job = match self.stores.jobs.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(e) => {
                warn!(thread_id = %thread.id, error = %e, "failed to load thread job");
                return None;
            }
        };
        if !job.is_waiting_on_user() {
            return None;
        }
        match self.stores.messages.last_of_kind(thread.id, INTAKE_QUESTIONS_KIND).await {
            Ok(Some(message)) if !hot_seqs.contains(&message.seq) => Some(message),
            Ok(_) => None,
            Err(e) => {
                warn!(thread_id = %thread.id, error = %e, "failed to load intake questions");
                None
            }
        }
    }

    /// Parentless RAPTOR summaries at every level, oldest range first
    async fn root_summaries(&self, thread_id: Uuid) -> Vec<SummaryNode> {
        let nodes = match self.stores.summaries.list_nodes(thread_id).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "failed to load summaries");
                return Vec::new();
            }
        };
        // a lower-level orphan covers messages its higher peers do not
        let mut roots: Vec<SummaryNode> = nodes.into_iter().filter(|n| n.parent_id.is_none()).collect();
        roots.sort_by(|a, b| a.start_seq.cmp(&b.start_seq).then(b.level.cmp(&a.level)));
        roots
    }

    async fn rewrite_query(
        &self,
        text: &str,
        summary: &str,
        hot: &[ChatMessage],
    ) -> std::result::Result<String, String> {
        if summary.trim().is_empty() && hot.is_empty() {
            return Ok(text.to_string());
        }
        let recent = hot
            .iter()
            .rev()
            .take(REWRITE_TURNS)
            .rev()
            .map(|m| {
                let snippet: String = m.content.chars().take(REWRITE_TURN_CHARS).collect();
                format!("{}: {}", m.role.as_str(), snippet)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "Conversation summary:\n{}\n\nRecent conversation:\n{}\n\nLatest message:\n{}",
            if summary.trim().is_empty() { "(none)" } else { summary },
            if recent.is_empty() { "(none)".to_string() } else { recent },
            text
        );
        let schema = JsonSchema::new(
            "contextual_query",
            json!({
                "type": "object",
                "properties": { "contextual_query": { "type": "string" } },
                "required": ["contextual_query"],
                "additionalProperties": false
            }),
        );
        let request = JsonRequest::new(QUERY_REWRITE_SYSTEM_PROMPT, user, schema).with_options(self.fast_options());
        let value = self.llm.generate_json(request).await.map_err(|e| e.to_string())?;
        match value.get("contextual_query").and_then(Value::as_str) {
            Some(q) if !q.trim().is_empty() => Ok(q.trim().to_string()),
            _ => Err("empty contextual_query".to_string()),
        }
    }

    /// Overview, concepts and materials docs for the path, synthesized when missing or stale
    async fn pin_path_docs(&self, user_id: Uuid, path: &LearningPath) -> Result<Vec<ChatDoc>> {
        let wanted = [DocType::PathOverview, DocType::PathConcepts, DocType::PathMaterials];
        let existing = self
            .stores
            .docs
            .list_docs(user_id, Scope::Path, Some(path.id), &wanted)
            .await?;
        let concepts = self.stores.paths.list_concepts(path.id).await?;
        let newest_concept = concepts.iter().map(|c| c.updated_at).max();
        let stale_after = chrono::Duration::seconds(self.config.concept_doc_stale_secs as i64);

        let mut snapshot: Option<PathSnapshot> = None;
        let mut pinned = Vec::new();
        for doc_type in wanted {
            let current_id = ids::chat_doc_id(doc_type, path.id, 0, CHAT_PATH_DOC_VERSION);
            let stored = existing.iter().find(|d| d.id == current_id);
            let usable = match (doc_type, stored) {
                (DocType::PathConcepts, Some(doc)) => {
                    let outdated = newest_concept.map(|t| t > doc.updated_at).unwrap_or(false);
                    let aged = Utc::now() - doc.updated_at > stale_after;
                    (!outdated && !aged).then(|| doc.clone())
                }
                (_, Some(doc)) => Some(doc.clone()),
                (_, None) => None,
            };
            if let Some(doc) = usable {
                pinned.push(doc);
                continue;
            }

            if snapshot.is_none() {
                snapshot = PathSnapshot::load(self.stores.paths.as_ref(), path.id).await?;
            }
            let Some(snap) = snapshot.as_ref() else {
                break;
            };
            let synthesized = match doc_type {
                DocType::PathOverview => Some(path_docs::overview_doc(user_id, snap)),
                DocType::PathConcepts if !snap.concepts.is_empty() => {
                    Some(path_docs::concepts_doc(user_id, snap))
                }
                DocType::PathMaterials => path_docs::materials_doc(user_id, snap),
                _ => None,
            };
            if let Some(doc) = synthesized {
                debug!(path_id = %path.id, doc_type = %doc_type, "synthesized path doc");
                pinned.push(doc);
            }
        }
        Ok(pinned)
    }

    /// Replace retrieved block bodies with the current node doc text; drop blocks that no longer exist
    async fn hydrate_unit_blocks(&self, docs: Vec<ChatDoc>) -> Vec<ChatDoc> {
        let mut cache: HashMap<Uuid, Option<NodeDoc>> = HashMap::new();
        let mut out = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if doc.doc_type != DocType::PathUnitBlock {
                out.push(doc);
                continue;
            }
            let Some(node_id) = doc.source_id else {
                continue;
            };
            if !cache.contains_key(&node_id) {
                let loaded = match self.stores.paths.get_node_doc(node_id).await {
                    Ok(found) => found.filter(|d| d.user_id == doc.user_id),
                    Err(e) => {
                        warn!(node_id = %node_id, error = %e, "failed to load node doc for hydration");
                        None
                    }
                };
                cache.insert(node_id, loaded);
            }
            let Some(Some(node_doc)) = cache.get(&node_id) else {
                continue;
            };
            let block = match parse_block_marker(&doc.text) {
                Some((block_id, _)) => node_doc.block(block_id),
                None => node_doc.blocks.get(doc.chunk_index as usize),
            };
            if let Some(block) = block {
                doc.text = format!("{}{}", block_marker(&block.id), block.render());
                doc.contextual_text = format!("{}: {}", node_doc.title.trim(), block.render());
                out.push(doc);
            }
        }
        out
    }

    async fn active_node_doc(&self, user_id: Uuid, node_id: Option<Uuid>) -> Option<NodeDoc> {
        let node_id = node_id?;
        match self.stores.paths.get_node_doc(node_id).await {
            Ok(doc) => doc.filter(|d| d.user_id == user_id),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "failed to load active node doc");
                None
            }
        }
    }

    async fn user_state_json(&self, user_id: Uuid, path_id: Option<Uuid>) -> Option<String> {
        let mut concepts = Vec::new();
        if let Some(path_id) = path_id {
            if let Ok(list) = self.stores.paths.list_concepts(path_id).await {
                let names: HashMap<Uuid, String> = list.iter().map(|c| (c.id, c.name.clone())).collect();
                let ids: Vec<Uuid> = list.iter().map(|c| c.id).collect();
                if let Ok(states) = self.stores.paths.list_concept_states(user_id, &ids).await {
                    for s in states {
                        concepts.push(json!({
                            "concept": names.get(&s.concept_id).cloned().unwrap_or_default(),
                            "mastery": s.mastery,
                            "confidence": s.confidence,
                        }));
                    }
                }
            }
        }
        let memory: Vec<Value> = match self.stores.memory.list_items(user_id, Scope::User, None).await {
            Ok(items) => items
                .into_iter()
                .filter(|i| matches!(i.kind, MemoryKind::Fact | MemoryKind::Preference))
                .map(|i| json!({ "kind": i.kind.as_str(), "key": i.key, "value": i.value }))
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to load user memory");
                Vec::new()
            }
        };
        if concepts.is_empty() && memory.is_empty() {
            return None;
        }
        serde_json::to_string_pretty(&json!({ "concepts": concepts, "memory": memory })).ok()
    }

    /// Entities mentioned in the query first, then the most recently evidenced
    async fn graph_items(&self, user_id: Uuid, thread_id: Uuid, query: &str) -> Vec<LaneItem> {
        let graph = &self.stores.graph;
        let (entities, edges, claims) = match tokio::try_join!(
            graph.list_entities(user_id, Scope::Thread, Some(thread_id)),
            graph.list_edges(user_id, Scope::Thread, Some(thread_id)),
            graph.list_claims(user_id, Scope::Thread, Some(thread_id)),
        ) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "failed to load chat graph");
                return Vec::new();
            }
        };
        if entities.is_empty() && claims.is_empty() {
            return Vec::new();
        }
        let lowered = query.to_lowercase();
        let mut ranked: Vec<_> = entities.iter().collect();
        ranked.sort_by_key(|e| {
            let mentioned = lowered.contains(&e.canonical_name);
            let latest = e.evidence_seqs.iter().max().copied().unwrap_or(0);
            (std::cmp::Reverse(mentioned), std::cmp::Reverse(latest))
        });
        ranked.truncate(GRAPH_ENTITIES);
        let names: HashMap<Uuid, &str> = ranked.iter().map(|e| (e.id, e.name.as_str())).collect();

        let mut items: Vec<LaneItem> = ranked
            .iter()
            .map(|e| {
                if e.description.trim().is_empty() {
                    LaneItem::plain(format!("- {} ({})", e.name, e.entity_type))
                } else {
                    LaneItem::plain(format!("- {} ({}): {}", e.name, e.entity_type, e.description.trim()))
                }
            })
            .collect();
        items.extend(edges.iter().filter_map(|edge| {
            let src = names.get(&edge.src_entity_id)?;
            let dst = names.get(&edge.dst_entity_id)?;
            Some(LaneItem::plain(format!("- {} {} {}", src, edge.relation, dst)))
        }));
        let mut claims: Vec<_> = claims.iter().collect();
        claims.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        items.extend(
            claims
                .into_iter()
                .take(GRAPH_CLAIMS)
                .map(|c| LaneItem::plain(format!("- Claim: {}", c.content.trim()))),
        );
        items
    }
}

fn doc_evidence(doc: &ChatDoc, label: &str) -> EvidenceSource {
    if doc.doc_type == DocType::PathUnitBlock {
        if let Some((block_id, body)) = parse_block_marker(&doc.text) {
            let node = doc.source_id.map(|id| id.to_string()).unwrap_or_default();
            let mut source = EvidenceSource::new(
                format!("block:{}:{}", node, block_id),
                EvidenceKind::UnitBlock,
                label,
                body.to_string(),
            );
            source.doc_id = Some(doc.id);
            source.block_id = Some(block_id.to_string());
            return source;
        }
    }
    let mut source = EvidenceSource::new(format!("doc:{}", doc.id), EvidenceKind::Doc, label, doc.text.clone());
    source.doc_id = Some(doc.id);
    source
}

fn doc_label(doc: &ChatDoc) -> String {
    match doc.doc_type {
        DocType::MessageChunk => match doc.source_seq {
            Some(seq) => format!("earlier message #{}", seq),
            None => "earlier message".to_string(),
        },
        DocType::Summary => "conversation summary".to_string(),
        DocType::Memory => "remembered detail".to_string(),
        DocType::Entity => "chat entity".to_string(),
        DocType::Claim => "chat claim".to_string(),
        DocType::PathOverview => "path overview".to_string(),
        DocType::PathNode => "path outline entry".to_string(),
        DocType::PathConcepts => "concept graph".to_string(),
        DocType::PathMaterials => "material list".to_string(),
        DocType::PathUnitDoc => "lesson".to_string(),
        DocType::PathUnitBlock => "lesson block".to_string(),
    }
}

fn doc_item(doc: &ChatDoc) -> LaneItem {
    let label = doc_label(doc);
    let evidence = doc_evidence(doc, &label);
    let body = evidence.text.trim().to_string();
    LaneItem::sourced(format!("[source:{}] ({})\n{}", evidence.id, label, body), evidence)
}

fn block_item(node_doc: &NodeDoc, block: &lumen_types::DocBlock, text: String) -> LaneItem {
    let mut source = EvidenceSource::new(
        format!("block:{}:{}", node_doc.node_id, block.id),
        EvidenceKind::UnitBlock,
        format!("{}: {}", node_doc.title.trim(), block.title.as_deref().unwrap_or(&block.block_type)),
        block.render(),
    );
    source.block_id = Some(block.id.clone());
    LaneItem::sourced(format!("[source:{}]\n{}", source.id, text), source)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}

#[async_trait]
impl ContextPlanner for DefaultContextPlanner {
    #[instrument(skip(self, input), fields(thread_id = %input.thread.id, user_message_id = %input.user_message.id))]
    async fn plan(&self, input: PlanInput) -> Result<ContextPlan> {
        let user_text = input.user_text.trim().to_string();
        if user_text.is_empty() {
            return Err(ContextError::InputInvalid("user message is empty".into()));
        }
        if !input.thread.is_owned_by(input.user_id) {
            return Err(ContextError::InputInvalid("thread does not belong to user".into()));
        }
        let thread = &input.thread;
        let user_id = input.user_id;

        // 1. hot window
        let hot = self.hot_window(thread, &input.user_message).await?;
        let mut hot_seqs: HashSet<i64> = hot.iter().map(|m| m.seq).collect();
        hot_seqs.insert(input.user_message.seq);

        // 2. session snapshot
        let stored_session = match self.stores.paths.get_session_state(user_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "failed to load session state");
                None
            }
        };
        let session = merge_session(
            message_session(&input.user_message),
            stored_session,
            Utc::now(),
            chrono::Duration::seconds(self.config.session_stale_secs as i64),
        );
        let path = self
            .owned_path(user_id, thread.path_id.or(session.context.active_path_id))
            .await?;
        let path_id = path.as_ref().map(|p| p.id);
        let material_set_id = path.as_ref().and_then(|p| p.material_set_id);

        // 3. intake pin
        let intake = self.intake_pin(thread, &hot_seqs).await;

        // 4. routing
        let route_ctx = RouteContext {
            has_path: path.is_some(),
            has_session: !session.is_empty(),
            has_materials: material_set_id.is_some(),
        };
        let heuristic = heuristic_route(&user_text, route_ctx);
        let route = if self.config.router_use_llm {
            refine_route(
                self.llm.as_ref(),
                &user_text,
                route_ctx,
                heuristic,
                Duration::from_millis(self.config.router_timeout_ms),
                self.config.router_min_confidence,
                self.fast_model.as_deref(),
            )
            .await
        } else {
            heuristic
        };
        let lanes = route.lanes;

        // 5. budgets
        let roots = self.root_summaries(thread.id).await;
        let summary_text = roots
            .iter()
            .map(|n| n.summary_md.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let node_doc = if lanes.unit || lanes.viewport || route.mode == PlanMode::Edit {
            self.active_node_doc(user_id, session.context.active_node_id).await
        } else {
            None
        };

        let mut enabled = Vec::new();
        if !summary_text.is_empty() {
            enabled.push(Lane::Summary);
        }
        if intake.is_some() {
            enabled.push(Lane::Intake);
        }
        if !hot.is_empty() {
            enabled.push(Lane::HotWindow);
        }
        if lanes.viewport && !session.is_empty() {
            enabled.push(Lane::Viewport);
        }
        if (lanes.unit || route.mode == PlanMode::Edit) && node_doc.is_some() {
            enabled.push(Lane::Unit);
        }
        if path.is_some() {
            enabled.push(Lane::Path);
        }
        if lanes.concept && path.is_some() {
            enabled.push(Lane::Concept);
        }
        if lanes.user {
            enabled.push(Lane::User);
        }
        if lanes.retrieve {
            enabled.push(Lane::Retrieval);
        }
        if lanes.materials && material_set_id.is_some() {
            enabled.push(Lane::Materials);
        }
        if lanes.graph {
            enabled.push(Lane::Graph);
        }
        let allocation = allocate(&self.config.budgets, &enabled);

        // 6. query rewrite
        let (query, rewrite_error) = if lanes.retrieve && self.config.query_rewrite {
            match self.rewrite_query(&user_text, &summary_text, &hot).await {
                Ok(q) => (q, None),
                Err(e) => {
                    warn!(error = %e, "query rewrite failed; using raw query");
                    (user_text.clone(), Some(e))
                }
            }
        } else {
            (user_text.clone(), None)
        };

        // 7. retrieval
        let retrieval = if lanes.retrieve {
            let plan = RetrievalPlan {
                scope_thread: route.scopes.thread,
                scope_path: route.scopes.path && path_id.is_some(),
                scope_user: route.scopes.user,
                path_id,
                hot_seqs: hot_seqs.clone(),
            };
            match self.retriever.retrieve(thread, &query, &plan).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "retrieval failed; continuing without retrieved docs");
                    RetrievalResult::default()
                }
            }
        } else {
            RetrievalResult::default()
        };
        let retrieval_mode = retrieval.mode;

        // 8. path pinning
        let pinned = match &path {
            Some(path) => match self.pin_path_docs(user_id, path).await {
                Ok(docs) => docs,
                Err(e) => {
                    warn!(path_id = %path.id, error = %e, "path pinning failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let pinned_ids: HashSet<Uuid> = pinned.iter().map(|d| d.id).collect();

        // 9. unit hydration
        let retrieved: Vec<ChatDoc> = retrieval
            .docs
            .iter()
            .map(|d| d.doc.clone())
            .filter(|d| !pinned_ids.contains(&d.id))
            .collect();
        let retrieved = self.hydrate_unit_blocks(retrieved).await;

        // 10. materials
        let mut materials_trace = Value::Null;
        let material_hits: Vec<MaterialHit> = match (lanes.materials, material_set_id) {
            (true, Some(set_id)) => {
                let material_query = route.materials_query.clone().unwrap_or_else(|| query.clone());
                let result = self
                    .materials
                    .retrieve(MaterialQuery {
                        material_set_id: set_id,
                        path_id,
                        query: &material_query,
                        embedding: &retrieval.query_embedding,
                    })
                    .await;
                match result {
                    Ok(result) => {
                        materials_trace = serde_json::to_value(&result.trace).unwrap_or(Value::Null);
                        result.hits
                    }
                    Err(e) => {
                        warn!(error = %e, "material retrieval failed");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        // 11. lane rendering
        let mut builder = PromptBuilder::new(self.tokens.as_ref());
        let mut used_docs: Vec<ChatDoc> = Vec::new();

        if !summary_text.is_empty() {
            builder.section(
                Lane::Summary,
                "Thread summary",
                vec![LaneItem::plain(summary_text.clone())],
                allocation.get(Lane::Summary),
            );
        }
        if let Some(intake) = &intake {
            builder.section(
                Lane::Intake,
                "Pinned intake questions (awaiting the learner's answers)",
                vec![LaneItem::plain(intake.content.clone())],
                allocation.get(Lane::Intake),
            );
        }
        if !hot.is_empty() {
            let budget = allocation.get(Lane::HotWindow);
            let items = hot_window_items(&hot, self.tokens.as_ref(), budget);
            builder.section(Lane::HotWindow, "Recent conversation", items, budget);
        }

        if let Some(node_doc) = node_doc.as_ref().filter(|_| enabled.contains(&Lane::Viewport)) {
            let ctx = &session.context;
            let mut position = format!("The learner is viewing \"{}\"", node_doc.title.trim());
            if let Some(progress) = ctx.progress {
                position.push_str(&format!(", progress {:.0}%", progress * 100.0));
            }
            if let Some(scroll) = ctx.scroll_percent {
                position.push_str(&format!(", scrolled {:.0}%", scroll));
            }
            if session.stale {
                position.push_str(" (this position may be out of date)");
            }
            let mut items = vec![LaneItem::plain(position)];
            if route.unit.include_visible {
                for block_id in &ctx.visible_block_ids {
                    if let Some(block) = node_doc.block(block_id) {
                        items.push(block_item(node_doc, block, truncate_chars(&block.render(), VISIBLE_BLOCK_CHARS)));
                    }
                }
            }
            builder.section(Lane::Viewport, "Learner viewport", items, allocation.get(Lane::Viewport));
        }

        if let Some(node_doc) = node_doc.as_ref().filter(|_| enabled.contains(&Lane::Unit)) {
            let current = session.context.current_block_id.as_deref();
            let mut items = Vec::new();
            if let Some(block) = current.and_then(|id| node_doc.block(id)) {
                let text = match route.unit.current_block {
                    BlockDetail::None => None,
                    BlockDetail::Summary => Some(truncate_chars(&block.render(), BLOCK_SUMMARY_CHARS)),
                    BlockDetail::Full => Some(block.render()),
                };
                if let Some(text) = text {
                    items.push(block_item(node_doc, block, format!("(current block)\n{}", text)));
                }
            }
            for block in node_doc.blocks.iter().filter(|b| Some(b.id.as_str()) != current) {
                items.push(block_item(node_doc, block, block.render()));
            }
            if route.unit.include_lesson_index {
                if let Ok(nodes) = self.stores.paths.list_nodes(node_doc.path_id).await {
                    let parent = nodes.iter().find(|n| n.id == node_doc.node_id).and_then(|n| n.parent_id);
                    let siblings: Vec<String> = nodes
                        .iter()
                        .filter(|n| n.parent_id == parent)
                        .map(|n| {
                            let marker = if n.id == node_doc.node_id { " (current)" } else { "" };
                            format!("{}. {}{}", n.index + 1, n.title.trim(), marker)
                        })
                        .collect();
                    if !siblings.is_empty() {
                        items.push(LaneItem::plain(format!("Lessons in this unit:\n{}", siblings.join("\n"))));
                    }
                }
            }
            builder.section(Lane::Unit, "Current lesson", items, allocation.get(Lane::Unit));
        }

        let path_items: Vec<&ChatDoc> = pinned
            .iter()
            .filter(|d| matches!(d.doc_type, DocType::PathOverview | DocType::PathMaterials))
            .collect();
        if !path_items.is_empty() {
            let items = path_items.iter().map(|d| doc_item(d)).collect();
            let n = builder.section(Lane::Path, "Learning path", items, allocation.get(Lane::Path));
            used_docs.extend(path_items.into_iter().take(n).cloned());
        }

        if enabled.contains(&Lane::Concept) {
            if let Some(doc) = pinned.iter().find(|d| d.doc_type == DocType::PathConcepts) {
                let n = builder.section(Lane::Concept, "Concept graph", vec![doc_item(doc)], allocation.get(Lane::Concept));
                if n > 0 {
                    used_docs.push(doc.clone());
                }
            }
        }

        if lanes.user {
            if let Some(state) = self.user_state_json(user_id, path_id).await {
                builder.section(
                    Lane::User,
                    "Learner knowledge state (JSON)",
                    vec![LaneItem::plain(state)],
                    allocation.get(Lane::User),
                );
            }
        }

        if !retrieved.is_empty() {
            let items = retrieved.iter().map(doc_item).collect();
            let n = builder.section(Lane::Retrieval, "Retrieved context", items, allocation.get(Lane::Retrieval));
            used_docs.extend(retrieved.iter().take(n).cloned());
        }

        if !material_hits.is_empty() {
            let items = material_hits
                .iter()
                .map(|h| LaneItem::sourced(h.render(), h.evidence()))
                .collect();
            builder.section(Lane::Materials, "Source material excerpts", items, allocation.get(Lane::Materials));
        }

        if lanes.graph {
            let items = self.graph_items(user_id, thread.id, &user_text).await;
            builder.section(Lane::Graph, "Conversation knowledge graph", items, allocation.get(Lane::Graph));
        }

        let (context, evidence_sources, usage) = builder.finish();

        // 12. edit target
        let edit_target = match (&route.mode, &node_doc) {
            (PlanMode::Edit, Some(doc)) => resolve_edit_target(&user_text, doc, &session.context),
            _ => None,
        };

        // 13. firewall + base policy
        let mut instructions = format!("{}\n\n{}", INSTRUCTION_FIREWALL, ASSISTANT_BASE_PROMPT);
        if route.mode == PlanMode::Edit {
            instructions.push_str("\n\n");
            instructions.push_str(EDIT_MODE_PROMPT);
            if let Some(target) = &edit_target {
                instructions.push_str(&format!(
                    "\nTarget block: [source:block:{}:{}] (match confidence {:.2}).",
                    target.node_id, target.block_id, target.confidence
                ));
            }
        }
        if route.verbatim && !evidence_sources.iter().any(|s| s.is_material()) {
            instructions.push_str(
                "\n\nNo source-material excerpts are available for this request. Do not present any text as a verbatim quote from the learner's files.",
            );
        }
        if !context.is_empty() {
            instructions.push_str("\n\nCONTEXT\n\n");
            instructions.push_str(&context);
        }

        // 14. evidence set is what the builder collected from rendered lanes
        let trace = json!({
            "route": route,
            "allocation": allocation,
            "lanes": usage,
            "hot_seqs": hot.iter().map(|m| m.seq).collect::<Vec<_>>(),
            "session": {
                "present": !session.is_empty(),
                "stale": session.stale,
                "from_message": session.from_message,
            },
            "intake_pinned_seq": intake.as_ref().map(|m| m.seq),
            "query": query,
            "rewrite_error": rewrite_error,
            "retrieval_mode": retrieval_mode,
            "retrieval": retrieval.trace,
            "materials": materials_trace,
            "edit_target": edit_target,
            "evidence_ids": evidence_sources.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
        });

        info!(
            mode = ?route.mode,
            retrieval_mode = ?retrieval_mode,
            used_docs = used_docs.len(),
            evidence = evidence_sources.len(),
            "context planned"
        );

        Ok(ContextPlan {
            instructions,
            user_payload: user_text,
            used_docs,
            evidence_sources,
            retrieval_mode,
            edit_target,
            mode: route.mode,
            route,
            trace,
        })
    }
}
