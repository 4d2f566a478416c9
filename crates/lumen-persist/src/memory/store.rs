use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lumen_types::{
    ChatClaim, ChatDoc, ChatEdge, ChatEntity, ChatMemoryItem, ChatMessage, Concept, ConceptEdge,
    ConceptEvidence, Cursor, DocType, Job, JobStatus, LearningPath, MaterialChunk, MaterialFile,
    MessageStatus, NewJob, NewMessage, NodeDoc, PathNode, Scope, SummaryNode, Thread, ThreadState,
    Turn, UserConceptState, UserSessionState,
};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::text::{match_score, terms};
use crate::error::{PersistError, Result};
use crate::repositories::{
    ChatDocRepository, ChatGraphRepository, EnqueueOutcome, JobRepository, MemoryItemRepository,
    MessageRepository, PathRepository, SummaryRepository, ThreadRepository, ThreadStateRepository,
    TurnRepository,
};

#[derive(Default)]
struct Inner {
    threads: HashMap<Uuid, Thread>,
    messages: HashMap<Uuid, ChatMessage>,
    /// thread_id -> seq -> message_id
    thread_seqs: HashMap<Uuid, BTreeMap<i64, Uuid>>,
    turns: HashMap<Uuid, Turn>,
    states: HashMap<Uuid, ThreadState>,
    docs: HashMap<Uuid, ChatDoc>,
    summaries: HashMap<Uuid, SummaryNode>,
    entities: HashMap<Uuid, ChatEntity>,
    edges: HashMap<Uuid, ChatEdge>,
    claims: HashMap<Uuid, ChatClaim>,
    memory_items: HashMap<Uuid, ChatMemoryItem>,
    jobs: HashMap<Uuid, Job>,
    paths: HashMap<Uuid, LearningPath>,
    nodes: HashMap<Uuid, PathNode>,
    /// keyed by node_id
    node_docs: HashMap<Uuid, NodeDoc>,
    concepts: HashMap<Uuid, Concept>,
    concept_edges: Vec<ConceptEdge>,
    material_files: HashMap<Uuid, MaterialFile>,
    material_chunks: HashMap<Uuid, MaterialChunk>,
    concept_evidence: Vec<ConceptEvidence>,
    sessions: HashMap<Uuid, UserSessionState>,
    concept_states: HashMap<(Uuid, Uuid), UserConceptState>,
}

impl Inner {
    /// Insert at `seq = next_seq` and bump the counter; callers hold the write guard
    fn append(&mut self, message: NewMessage, now: DateTime<Utc>) -> Result<ChatMessage> {
        let thread = self
            .threads
            .get_mut(&message.thread_id)
            .ok_or(PersistError::ThreadNotFound(message.thread_id))?;
        let seq = thread.next_seq;
        thread.next_seq += 1;
        thread.updated_at = now;

        let row = ChatMessage {
            id: Uuid::new_v4(),
            thread_id: message.thread_id,
            user_id: message.user_id,
            role: message.role,
            seq,
            content: message.content,
            status: message.status,
            metadata: message.metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.thread_seqs
            .entry(row.thread_id)
            .or_default()
            .insert(seq, row.id);
        self.messages.insert(row.id, row.clone());
        Ok(row)
    }

    fn thread_messages(&self, thread_id: Uuid) -> impl DoubleEndedIterator<Item = &ChatMessage> + '_ {
        self.thread_seqs
            .get(&thread_id)
            .into_iter()
            .flat_map(|seqs| seqs.values())
            .filter_map(|id| self.messages.get(id))
            .filter(|m| !m.is_deleted())
    }

    fn runnable_match(&self, job: &NewJob) -> Option<&Job> {
        self.jobs.values().find(|j| {
            j.owner_user_id == job.owner_user_id
                && j.entity_type == job.entity_type
                && j.entity_id == job.entity_id
                && j.job_type == job.job_type
                && j.status.is_runnable()
        })
    }

    fn insert_job(&mut self, job: NewJob) -> Job {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            owner_user_id: job.owner_user_id,
            job_type: job.job_type,
            entity_type: job.entity_type,
            entity_id: job.entity_id,
            payload: job.payload,
            status: JobStatus::Queued,
            stage: None,
            attempt: 0,
            max_attempts: job.max_attempts,
            run_after: now,
            locked_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }
}

fn in_scope(scope: Scope, scope_id: Option<Uuid>, row_scope: Scope, row_scope_id: Option<Uuid>) -> bool {
    scope == row_scope && scope_id == row_scope_id
}

fn merge_seqs(into: &mut Vec<i64>, more: &[i64]) {
    into.extend_from_slice(more);
    into.sort_unstable();
    into.dedup();
}

/// Single-process implementation of every store contract
///
/// One lock guards all tables, so multi-row writes (seq allocation, RAPTOR parent
/// rebinding, deduplicated enqueue) are atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_path(&self, path: LearningPath) {
        self.inner.write().await.paths.insert(path.id, path);
    }

    pub async fn insert_node(&self, node: PathNode) {
        self.inner.write().await.nodes.insert(node.id, node);
    }

    pub async fn insert_node_doc(&self, doc: NodeDoc) {
        self.inner.write().await.node_docs.insert(doc.node_id, doc);
    }

    pub async fn insert_concept(&self, concept: Concept) {
        self.inner.write().await.concepts.insert(concept.id, concept);
    }

    pub async fn insert_concept_edge(&self, edge: ConceptEdge) {
        self.inner.write().await.concept_edges.push(edge);
    }

    pub async fn insert_material_file(&self, file: MaterialFile) {
        self.inner.write().await.material_files.insert(file.id, file);
    }

    pub async fn insert_material_chunk(&self, chunk: MaterialChunk) {
        self.inner.write().await.material_chunks.insert(chunk.id, chunk);
    }

    pub async fn insert_concept_evidence(&self, evidence: ConceptEvidence) {
        self.inner.write().await.concept_evidence.push(evidence);
    }

    pub async fn insert_concept_state(&self, state: UserConceptState) {
        self.inner
            .write()
            .await
            .concept_states
            .insert((state.user_id, state.concept_id), state);
    }

    /// Force a job's status and stage, e.g. to park it at a waitpoint
    pub async fn set_job_status(&self, job_id: Uuid, status: JobStatus, stage: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&job_id).ok_or(PersistError::JobNotFound(job_id))?;
        job.status = status;
        job.stage = stage;
        job.updated_at = Utc::now();
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.read().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn all_docs(&self) -> Vec<ChatDoc> {
        let mut docs: Vec<ChatDoc> = self.inner.read().await.docs.values().cloned().collect();
        docs.sort_by_key(|d| d.id);
        docs
    }
}

#[async_trait]
impl ThreadRepository for MemoryStore {
    async fn create_thread(&self, thread: Thread) -> Result<Thread> {
        let mut inner = self.inner.write().await;
        if inner.threads.contains_key(&thread.id) {
            return Err(PersistError::Conflict(format!("thread {} exists", thread.id)));
        }
        inner.threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>> {
        Ok(self.inner.read().await.threads.get(&thread_id).cloned())
    }

    async fn list_threads(&self, user_id: Uuid, limit: usize) -> Result<Vec<Thread>> {
        let inner = self.inner.read().await;
        let mut threads: Vec<Thread> = inner
            .threads
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        threads.truncate(limit);
        Ok(threads)
    }

    async fn set_thread_job(&self, thread_id: Uuid, job_id: Option<Uuid>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let thread = inner
            .threads
            .get_mut(&thread_id)
            .ok_or(PersistError::ThreadNotFound(thread_id))?;
        thread.job_id = job_id;
        thread.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_thread(&self, thread_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(thread) = inner.threads.get_mut(&thread_id) {
            thread.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn append_message(&self, message: NewMessage) -> Result<ChatMessage> {
        let mut inner = self.inner.write().await;
        inner.append(message, Utc::now())
    }

    async fn append_pair(&self, first: NewMessage, second: NewMessage) -> Result<(ChatMessage, ChatMessage)> {
        if first.thread_id != second.thread_id {
            return Err(PersistError::Conflict("message pair spans two threads".to_string()));
        }
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let first = inner.append(first, now)?;
        let second = inner.append(second, now)?;
        Ok((first, second))
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<ChatMessage>> {
        Ok(self.inner.read().await.messages.get(&message_id).cloned())
    }

    async fn list_recent(&self, thread_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        let mut recent: Vec<ChatMessage> = inner
            .thread_messages(thread_id)
            .rev()
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn list_range(
        &self,
        thread_id: Uuid,
        after_seq: i64,
        up_to_seq: i64,
    ) -> Result<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .thread_messages(thread_id)
            .filter(|m| m.seq > after_seq && m.seq <= up_to_seq)
            .cloned()
            .collect())
    }

    async fn list_before(
        &self,
        thread_id: Uuid,
        before_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        let before = before_seq.unwrap_or(i64::MAX);
        let mut page: Vec<ChatMessage> = inner
            .thread_messages(thread_id)
            .rev()
            .filter(|m| m.seq < before)
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn last_of_kind(&self, thread_id: Uuid, kind: &str) -> Result<Option<ChatMessage>> {
        let inner = self.inner.read().await;
        let found = inner
            .thread_messages(thread_id)
            .rev()
            .find(|m| m.kind() == Some(kind))
            .cloned();
        Ok(found)
    }

    async fn update_content(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .get_mut(&message_id)
            .ok_or(PersistError::MessageNotFound(message_id))?;
        msg.content = content.to_string();
        msg.status = status;
        msg.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize_message(
        &self,
        message_id: Uuid,
        content: &str,
        status: MessageStatus,
        metadata: Value,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .get_mut(&message_id)
            .ok_or(PersistError::MessageNotFound(message_id))?;
        msg.content = content.to_string();
        msg.status = status;
        msg.metadata = metadata;
        msg.updated_at = Utc::now();
        Ok(())
    }

    async fn search_messages(
        &self,
        thread_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(ChatMessage, f32)>> {
        let query_terms = terms(query);
        let inner = self.inner.read().await;
        let mut hits: Vec<(ChatMessage, f32)> = inner
            .thread_messages(thread_id)
            .map(|m| (m, match_score(&query_terms, &m.content)))
            .filter(|(_, score)| *score > 0.0)
            .map(|(m, score)| (m.clone(), score))
            .collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.0.seq.cmp(&a.0.seq))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait]
impl TurnRepository for MemoryStore {
    async fn create_turn(&self, turn: Turn) -> Result<Turn> {
        self.inner.write().await.turns.insert(turn.id, turn.clone());
        Ok(turn)
    }

    async fn get_turn(&self, turn_id: Uuid) -> Result<Option<Turn>> {
        Ok(self.inner.read().await.turns.get(&turn_id).cloned())
    }

    async fn update_turn(&self, turn: &Turn) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.turns.contains_key(&turn.id) {
            return Err(PersistError::TurnNotFound(turn.id));
        }
        inner.turns.insert(turn.id, turn.clone());
        Ok(())
    }
}

#[async_trait]
impl ThreadStateRepository for MemoryStore {
    async fn ensure_state(&self, thread_id: Uuid) -> Result<ThreadState> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .states
            .entry(thread_id)
            .or_insert_with(|| ThreadState::new(thread_id))
            .clone())
    }

    async fn advance_cursor(&self, thread_id: Uuid, cursor: Cursor, proposed: i64) -> Result<i64> {
        let mut inner = self.inner.write().await;
        let state = inner
            .states
            .entry(thread_id)
            .or_insert_with(|| ThreadState::new(thread_id));
        let stored = state.advance(cursor, proposed);
        state.updated_at = Utc::now();
        Ok(stored)
    }

    async fn advance_cursor_in_epoch(
        &self,
        thread_id: Uuid,
        epoch: i64,
        cursor: Cursor,
        proposed: i64,
    ) -> Result<Option<i64>> {
        let mut inner = self.inner.write().await;
        let state = inner
            .states
            .entry(thread_id)
            .or_insert_with(|| ThreadState::new(thread_id));
        if state.epoch != epoch {
            return Ok(None);
        }
        let stored = state.advance(cursor, proposed);
        state.updated_at = Utc::now();
        Ok(Some(stored))
    }

    async fn set_conversation_id(&self, thread_id: Uuid, conversation_id: &str) -> Result<String> {
        let mut inner = self.inner.write().await;
        let state = inner
            .states
            .entry(thread_id)
            .or_insert_with(|| ThreadState::new(thread_id));
        if let Some(existing) = &state.openai_conversation_id {
            return Ok(existing.clone());
        }
        state.openai_conversation_id = Some(conversation_id.to_string());
        state.updated_at = Utc::now();
        Ok(conversation_id.to_string())
    }

    async fn reset_cursors(&self, thread_id: Uuid) -> Result<i64> {
        let mut inner = self.inner.write().await;
        let state = inner
            .states
            .entry(thread_id)
            .or_insert_with(|| ThreadState::new(thread_id));
        state.last_indexed_seq = 0;
        state.last_summarized_seq = 0;
        state.last_graph_seq = 0;
        state.last_memory_seq = 0;
        state.epoch += 1;
        state.updated_at = Utc::now();
        Ok(state.epoch)
    }
}

#[async_trait]
impl ChatDocRepository for MemoryStore {
    async fn upsert_docs(&self, docs: Vec<ChatDoc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for mut doc in docs {
            if let Some(existing) = inner.docs.get(&doc.id) {
                doc.created_at = existing.created_at;
            }
            inner.docs.insert(doc.id, doc);
        }
        Ok(())
    }

    async fn get_docs(&self, user_id: Uuid, ids: &[Uuid]) -> Result<Vec<ChatDoc>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.docs.get(id))
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_docs(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
        doc_types: &[DocType],
    ) -> Result<Vec<ChatDoc>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<ChatDoc> = inner
            .docs
            .values()
            .filter(|d| d.user_id == user_id && in_scope(scope, scope_id, d.scope, d.scope_id))
            .filter(|d| doc_types.is_empty() || doc_types.contains(&d.doc_type))
            .cloned()
            .collect();
        docs.sort_by(|a, b| {
            (a.source_seq, a.chunk_index, a.id).cmp(&(b.source_seq, b.chunk_index, b.id))
        });
        Ok(docs)
    }

    async fn delete_docs(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
        doc_types: &[DocType],
    ) -> Result<Vec<ChatDoc>> {
        let mut inner = self.inner.write().await;
        let ids: Vec<Uuid> = inner
            .docs
            .values()
            .filter(|d| d.user_id == user_id && in_scope(scope, scope_id, d.scope, d.scope_id))
            .filter(|d| doc_types.is_empty() || doc_types.contains(&d.doc_type))
            .map(|d| d.id)
            .collect();
        Ok(ids.iter().filter_map(|id| inner.docs.remove(id)).collect())
    }

    async fn delete_thread_docs(&self, thread_id: Uuid, doc_types: &[DocType]) -> Result<Vec<ChatDoc>> {
        let mut inner = self.inner.write().await;
        let ids: Vec<Uuid> = inner
            .docs
            .values()
            .filter(|d| d.thread_id == Some(thread_id))
            .filter(|d| doc_types.is_empty() || doc_types.contains(&d.doc_type))
            .map(|d| d.id)
            .collect();
        Ok(ids.iter().filter_map(|id| inner.docs.remove(id)).collect())
    }
}

#[async_trait]
impl SummaryRepository for MemoryStore {
    async fn get_node(&self, node_id: Uuid) -> Result<Option<SummaryNode>> {
        Ok(self.inner.read().await.summaries.get(&node_id).cloned())
    }

    async fn list_nodes(&self, thread_id: Uuid) -> Result<Vec<SummaryNode>> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<SummaryNode> = inner
            .summaries
            .values()
            .filter(|n| n.thread_id == thread_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.level, n.start_seq, n.id));
        Ok(nodes)
    }

    async fn list_orphans(&self, thread_id: Uuid, level: u32) -> Result<Vec<SummaryNode>> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<SummaryNode> = inner
            .summaries
            .values()
            .filter(|n| n.thread_id == thread_id && n.level == level && n.parent_id.is_none())
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.start_seq, n.id));
        Ok(nodes)
    }

    async fn insert_node(&self, node: SummaryNode) -> Result<SummaryNode> {
        let mut inner = self.inner.write().await;
        Ok(inner.summaries.entry(node.id).or_insert(node).clone())
    }

    async fn create_parent(&self, parent: SummaryNode) -> Result<SummaryNode> {
        let mut inner = self.inner.write().await;

        for child_id in &parent.child_node_ids {
            let child = inner.summaries.get(child_id).ok_or(PersistError::NotFound {
                entity: "summary node",
                id: child_id.to_string(),
            })?;
            if let Some(existing) = child.parent_id {
                if existing != parent.id {
                    return Err(PersistError::Conflict(format!(
                        "summary node {} already bound to {}",
                        child_id, existing
                    )));
                }
            }
        }

        let stored = inner.summaries.entry(parent.id).or_insert(parent).clone();
        let now = Utc::now();
        for child_id in &stored.child_node_ids {
            if let Some(child) = inner.summaries.get_mut(child_id) {
                child.parent_id = Some(stored.id);
                child.updated_at = now;
            }
        }
        Ok(stored)
    }

    async fn delete_nodes(&self, thread_id: Uuid) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.summaries.len();
        inner.summaries.retain(|_, n| n.thread_id != thread_id);
        Ok(before - inner.summaries.len())
    }
}

#[async_trait]
impl ChatGraphRepository for MemoryStore {
    async fn upsert_entity(&self, entity: ChatEntity) -> Result<ChatEntity> {
        let mut inner = self.inner.write().await;
        let existing_id = inner
            .entities
            .values()
            .find(|e| {
                e.user_id == entity.user_id
                    && in_scope(entity.scope, entity.scope_id, e.scope, e.scope_id)
                    && e.canonical_name == entity.canonical_name
            })
            .map(|e| e.id);

        let Some(existing) = existing_id.and_then(|id| inner.entities.get_mut(&id)) else {
            inner.entities.insert(entity.id, entity.clone());
            return Ok(entity);
        };
        merge_seqs(&mut existing.evidence_seqs, &entity.evidence_seqs);
        for alias in entity.aliases {
            if !existing.aliases.contains(&alias) {
                existing.aliases.push(alias);
            }
        }
        if !entity.description.trim().is_empty() {
            existing.description = entity.description;
        }
        if existing.entity_type.is_empty() {
            existing.entity_type = entity.entity_type;
        }
        existing.updated_at = Utc::now();
        Ok(existing.clone())
    }

    async fn insert_edge(&self, edge: ChatEdge) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.edges.get_mut(&edge.id) {
            Some(existing) => merge_seqs(&mut existing.evidence_seqs, &edge.evidence_seqs),
            None => {
                inner.edges.insert(edge.id, edge);
            }
        }
        Ok(())
    }

    async fn insert_claim(&self, claim: ChatClaim) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.claims.get_mut(&claim.id) {
            Some(existing) => merge_seqs(&mut existing.evidence_seqs, &claim.evidence_seqs),
            None => {
                inner.claims.insert(claim.id, claim);
            }
        }
        Ok(())
    }

    async fn list_entities(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatEntity>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<ChatEntity> = inner
            .entities
            .values()
            .filter(|e| e.user_id == user_id && in_scope(scope, scope_id, e.scope, e.scope_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));
        Ok(rows)
    }

    async fn list_edges(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatEdge>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<ChatEdge> = inner
            .edges
            .values()
            .filter(|e| e.user_id == user_id && in_scope(scope, scope_id, e.scope, e.scope_id))
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.id);
        Ok(rows)
    }

    async fn list_claims(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatClaim>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<ChatClaim> = inner
            .claims
            .values()
            .filter(|c| c.user_id == user_id && in_scope(scope, scope_id, c.scope, c.scope_id))
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.id);
        Ok(rows)
    }

    async fn delete_graph(&self, user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .entities
            .retain(|_, e| !(e.user_id == user_id && in_scope(scope, scope_id, e.scope, e.scope_id)));
        inner
            .edges
            .retain(|_, e| !(e.user_id == user_id && in_scope(scope, scope_id, e.scope, e.scope_id)));
        inner
            .claims
            .retain(|_, c| !(c.user_id == user_id && in_scope(scope, scope_id, c.scope, c.scope_id)));
        Ok(())
    }
}

#[async_trait]
impl MemoryItemRepository for MemoryStore {
    async fn upsert_item(&self, item: ChatMemoryItem) -> Result<ChatMemoryItem> {
        let mut inner = self.inner.write().await;
        let existing_id = inner
            .memory_items
            .values()
            .find(|m| m.deleted_at.is_none() && m.same_key(&item))
            .map(|m| m.id);

        let Some(existing) = existing_id.and_then(|id| inner.memory_items.get_mut(&id)) else {
            inner.memory_items.insert(item.id, item.clone());
            return Ok(item);
        };
        existing.value = item.value;
        existing.confidence = item.confidence;
        existing.evidence_seqs = item.evidence_seqs;
        existing.updated_at = Utc::now();
        Ok(existing.clone())
    }

    async fn list_items(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatMemoryItem>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<ChatMemoryItem> = inner
            .memory_items
            .values()
            .filter(|m| m.deleted_at.is_none())
            .filter(|m| m.user_id == user_id && in_scope(scope, scope_id, m.scope, m.scope_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.kind.as_str(), &a.key).cmp(&(b.kind.as_str(), &b.key)));
        Ok(rows)
    }

    async fn delete_items(&self, user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut count = 0;
        for item in inner.memory_items.values_mut() {
            if item.deleted_at.is_none()
                && item.user_id == user_id
                && in_scope(scope, scope_id, item.scope, item.scope_id)
            {
                item.deleted_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl PathRepository for MemoryStore {
    async fn get_path(&self, path_id: Uuid) -> Result<Option<LearningPath>> {
        Ok(self.inner.read().await.paths.get(&path_id).cloned())
    }

    async fn list_nodes(&self, path_id: Uuid) -> Result<Vec<PathNode>> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<PathNode> = inner
            .nodes
            .values()
            .filter(|n| n.path_id == path_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.parent_id, n.index, n.id));
        Ok(nodes)
    }

    async fn get_node_doc(&self, node_id: Uuid) -> Result<Option<NodeDoc>> {
        Ok(self.inner.read().await.node_docs.get(&node_id).cloned())
    }

    async fn list_node_docs(&self, path_id: Uuid) -> Result<Vec<NodeDoc>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<NodeDoc> = inner
            .node_docs
            .values()
            .filter(|d| d.path_id == path_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.node_id);
        Ok(docs)
    }

    async fn list_concepts(&self, path_id: Uuid) -> Result<Vec<Concept>> {
        let inner = self.inner.read().await;
        let mut concepts: Vec<Concept> = inner
            .concepts
            .values()
            .filter(|c| c.path_id == path_id)
            .cloned()
            .collect();
        concepts.sort_by(|a, b| (a.depth, &a.key).cmp(&(b.depth, &b.key)));
        Ok(concepts)
    }

    async fn list_concept_edges(&self, path_id: Uuid) -> Result<Vec<ConceptEdge>> {
        let inner = self.inner.read().await;
        Ok(inner
            .concept_edges
            .iter()
            .filter(|e| e.path_id == path_id)
            .cloned()
            .collect())
    }

    async fn list_material_files(&self, material_set_id: Uuid) -> Result<Vec<MaterialFile>> {
        let inner = self.inner.read().await;
        let mut files: Vec<MaterialFile> = inner
            .material_files
            .values()
            .filter(|f| f.material_set_id == material_set_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.original_name.cmp(&b.original_name));
        Ok(files)
    }

    async fn list_material_chunks(&self, material_set_id: Uuid) -> Result<Vec<MaterialChunk>> {
        let inner = self.inner.read().await;
        let mut chunks: Vec<MaterialChunk> = inner
            .material_chunks
            .values()
            .filter(|c| c.material_set_id == material_set_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| (c.material_file_id, c.index));
        Ok(chunks)
    }

    async fn get_material_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<MaterialChunk>> {
        let inner = self.inner.read().await;
        Ok(chunk_ids
            .iter()
            .filter_map(|id| inner.material_chunks.get(id))
            .cloned()
            .collect())
    }

    async fn search_material_chunks(
        &self,
        material_set_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(MaterialChunk, f32)>> {
        let query_terms = terms(query);
        let inner = self.inner.read().await;
        let mut hits: Vec<(MaterialChunk, f32)> = inner
            .material_chunks
            .values()
            .filter(|c| c.material_set_id == material_set_id)
            .map(|c| (c, match_score(&query_terms, &c.text)))
            .filter(|(_, s)| *s > 0.0)
            .map(|(c, s)| (c.clone(), s))
            .collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn evidence_for_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>> {
        let inner = self.inner.read().await;
        Ok(inner
            .concept_evidence
            .iter()
            .filter(|e| chunk_ids.contains(&e.material_chunk_id))
            .cloned()
            .collect())
    }

    async fn evidence_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>> {
        let inner = self.inner.read().await;
        Ok(inner
            .concept_evidence
            .iter()
            .filter(|e| concept_ids.contains(&e.concept_id))
            .cloned()
            .collect())
    }

    async fn get_session_state(&self, user_id: Uuid) -> Result<Option<UserSessionState>> {
        Ok(self.inner.read().await.sessions.get(&user_id).cloned())
    }

    async fn put_session_state(&self, state: UserSessionState) -> Result<()> {
        self.inner.write().await.sessions.insert(state.user_id, state);
        Ok(())
    }

    async fn list_concept_states(
        &self,
        user_id: Uuid,
        concept_ids: &[Uuid],
    ) -> Result<Vec<UserConceptState>> {
        let inner = self.inner.read().await;
        Ok(concept_ids
            .iter()
            .filter_map(|cid| inner.concept_states.get(&(user_id, *cid)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        Ok(self.inner.write().await.insert_job(job))
    }

    async fn enqueue_unique(&self, job: NewJob) -> Result<EnqueueOutcome> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.runnable_match(&job) {
            return Ok(EnqueueOutcome::Existing(existing.clone()));
        }
        Ok(EnqueueOutcome::Enqueued(inner.insert_job(job)))
    }

    async fn has_runnable_for_entity(
        &self,
        owner_user_id: Uuid,
        entity_type: &str,
        entity_id: Option<Uuid>,
        job_type: &str,
    ) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.values().any(|j| {
            j.owner_user_id == owner_user_id
                && j.entity_type == entity_type
                && j.entity_id == entity_id
                && j.job_type == job_type
                && j.status.is_runnable()
        }))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    async fn latest_for_entity(
        &self,
        owner_user_id: Uuid,
        entity_type: &str,
        entity_id: Uuid,
        job_type: Option<&str>,
    ) -> Result<Option<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| {
                j.owner_user_id == owner_user_id
                    && j.entity_type == entity_type
                    && j.entity_id == Some(entity_id)
                    && job_type.map(|t| j.job_type == t).unwrap_or(true)
            })
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn lease_job(&self, job_types: &[String], lease: Duration) -> Result<Option<Job>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let due = |j: &Job| match j.status {
            JobStatus::Queued => j.run_after <= now,
            JobStatus::Running => j.locked_until.map(|t| t <= now).unwrap_or(true),
            _ => false,
        };

        let next_id = inner
            .jobs
            .values()
            .filter(|j| job_types.iter().any(|t| *t == j.job_type) && due(j))
            .min_by_key(|j| (j.run_after, j.created_at))
            .map(|j| j.id);

        let Some(job) = next_id.and_then(|id| inner.jobs.get_mut(&id)) else {
            return Ok(None);
        };
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        job.status = JobStatus::Running;
        job.locked_until = Some(now + lease);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&job_id).ok_or(PersistError::JobNotFound(job_id))?;
        job.status = JobStatus::Succeeded;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&job_id).ok_or(PersistError::JobNotFound(job_id))?;
        job.last_error = Some(error.to_string());
        job.locked_until = None;
        job.updated_at = Utc::now();
        match retry_at {
            Some(at) => {
                job.status = JobStatus::Queued;
                job.attempt += 1;
                job.run_after = at;
            }
            None => job.status = JobStatus::Failed,
        }
        Ok(job.clone())
    }
}
