use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use lumen_types::{
    ChatClaim, ChatDoc, ChatEdge, ChatEntity, ChatMemoryItem, Concept, ConceptEdge,
    ConceptEvidence, DocType, LearningPath, MaterialChunk, MaterialFile, NodeDoc, PathNode, Scope,
    SummaryNode, UserConceptState, UserSessionState,
};
use mongodb::bson::{doc, Bson, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::dbs::mongo::client::*;
use crate::dbs::mongo::models::MongoRow;
use crate::error::{PersistError, Result};
use crate::memory::text::{match_score, terms};
use crate::repositories::{
    ChatDocRepository, ChatGraphRepository, MemoryItemRepository, PathRepository,
    SummaryRepository,
};

fn opt_id(id: Option<Uuid>) -> Bson {
    id.map(|id| Bson::String(id.to_string())).unwrap_or(Bson::Null)
}

fn id_list(ids: &[Uuid]) -> Vec<String> {
    ids.iter().map(Uuid::to_string).collect()
}

fn scope_keys(user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Document {
    doc! {
        "user_id": user_id.to_string(),
        "scope": scope.as_str(),
        "scope_id": opt_id(scope_id),
    }
}

fn scope_filter(user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Document {
    doc! {
        "keys.user_id": user_id.to_string(),
        "keys.scope": scope.as_str(),
        "keys.scope_id": opt_id(scope_id),
    }
}

fn with_doc_types(mut filter: Document, doc_types: &[DocType]) -> Document {
    if !doc_types.is_empty() {
        let names: Vec<&str> = doc_types.iter().map(DocType::as_str).collect();
        filter.insert("keys.doc_type", doc! { "$in": names });
    }
    filter
}

fn merge_seqs(into: &mut Vec<i64>, more: &[i64]) {
    into.extend_from_slice(more);
    into.sort_unstable();
    into.dedup();
}

impl MongoStore {
    async fn put_row<T: Serialize + Sync>(
        &self,
        collection: &str,
        id: String,
        keys: Document,
        row: &T,
    ) -> Result<()> {
        let wrapped = MongoRow::wrap(id, keys, row)?;
        self.rows(collection)
            .replace_one(doc! { "_id": wrapped.id.clone() }, wrapped)
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Insert unless the id exists; returns the stored row either way
    async fn insert_row<T: Serialize + DeserializeOwned + Sync>(
        &self,
        collection: &str,
        id: String,
        keys: Document,
        row: T,
    ) -> Result<T> {
        let wrapped = MongoRow::wrap(id.clone(), keys, &row)?;
        match self.rows(collection).insert_one(wrapped).await {
            Ok(_) => Ok(row),
            Err(e) if is_duplicate_key(&e) => self
                .get_row(collection, &id)
                .await?
                .ok_or(PersistError::NotFound { entity: "row", id }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_row<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        self.rows(collection)
            .find_one(doc! { "_id": id })
            .await?
            .map(MongoRow::unwrap_row)
            .transpose()
    }

    async fn find_rows<T: DeserializeOwned>(&self, collection: &str, filter: Document) -> Result<Vec<T>> {
        let rows: Vec<MongoRow> = self.rows(collection).find(filter).await?.try_collect().await?;
        rows.into_iter().map(MongoRow::unwrap_row).collect()
    }

    async fn delete_rows(&self, collection: &str, filter: Document) -> Result<u64> {
        Ok(self.rows(collection).delete_many(filter).await?.deleted_count)
    }

    async fn put_summary(&self, node: &SummaryNode) -> Result<()> {
        self.put_row(SUMMARY_NODES, node.id.to_string(), summary_keys(node), node)
            .await
    }

    /// Write authored path content; the planner and path indexer only read it
    pub async fn put_path(&self, path: &LearningPath) -> Result<()> {
        self.put_row(PATHS, path.id.to_string(), doc! { "user_id": path.user_id.to_string() }, path)
            .await
    }

    pub async fn put_path_node(&self, node: &PathNode) -> Result<()> {
        self.put_row(PATH_NODES, node.id.to_string(), doc! { "path_id": node.path_id.to_string() }, node)
            .await
    }

    pub async fn put_node_doc(&self, node_doc: &NodeDoc) -> Result<()> {
        let keys = doc! {
            "path_id": node_doc.path_id.to_string(),
            "node_id": node_doc.node_id.to_string(),
        };
        self.put_row(NODE_DOCS, node_doc.id.to_string(), keys, node_doc).await
    }

    pub async fn put_concept(&self, concept: &Concept) -> Result<()> {
        self.put_row(CONCEPTS, concept.id.to_string(), doc! { "path_id": concept.path_id.to_string() }, concept)
            .await
    }

    pub async fn put_concept_edge(&self, edge: &ConceptEdge) -> Result<()> {
        self.put_row(CONCEPT_EDGES, edge.id.to_string(), doc! { "path_id": edge.path_id.to_string() }, edge)
            .await
    }

    pub async fn put_material_file(&self, file: &MaterialFile) -> Result<()> {
        let keys = doc! { "material_set_id": file.material_set_id.to_string() };
        self.put_row(MATERIAL_FILES, file.id.to_string(), keys, file).await
    }

    pub async fn put_material_chunk(&self, chunk: &MaterialChunk) -> Result<()> {
        let keys = doc! { "material_set_id": chunk.material_set_id.to_string() };
        self.put_row(MATERIAL_CHUNKS, chunk.id.to_string(), keys, chunk).await
    }

    pub async fn put_concept_evidence(&self, evidence: &ConceptEvidence) -> Result<()> {
        let keys = doc! {
            "concept_id": evidence.concept_id.to_string(),
            "material_chunk_id": evidence.material_chunk_id.to_string(),
        };
        self.put_row(CONCEPT_EVIDENCE, evidence.id.to_string(), keys, evidence).await
    }

    pub async fn put_concept_state(&self, state: &UserConceptState) -> Result<()> {
        let keys = doc! {
            "user_id": state.user_id.to_string(),
            "concept_id": state.concept_id.to_string(),
        };
        let id = format!("{}:{}", state.user_id, state.concept_id);
        self.put_row(CONCEPT_STATES, id, keys, state).await
    }
}

fn summary_keys(node: &SummaryNode) -> Document {
    doc! {
        "thread_id": node.thread_id.to_string(),
        "level": i64::from(node.level),
        "parent_id": opt_id(node.parent_id),
    }
}

fn doc_keys(d: &ChatDoc) -> Document {
    let mut keys = scope_keys(d.user_id, d.scope, d.scope_id);
    keys.insert("doc_type", d.doc_type.as_str());
    keys.insert("thread_id", opt_id(d.thread_id));
    keys
}

fn memory_keys(item: &ChatMemoryItem) -> Document {
    let mut keys = scope_keys(item.user_id, item.scope, item.scope_id);
    keys.insert("kind", item.kind.as_str());
    keys.insert("key", item.key.to_lowercase());
    keys.insert("deleted", item.deleted_at.is_some());
    keys
}

#[async_trait]
impl ChatDocRepository for MongoStore {
    async fn upsert_docs(&self, docs: Vec<ChatDoc>) -> Result<()> {
        for mut d in docs {
            if let Some(existing) = self.get_row::<ChatDoc>(CHAT_DOCS, &d.id.to_string()).await? {
                d.created_at = existing.created_at;
            }
            self.put_row(CHAT_DOCS, d.id.to_string(), doc_keys(&d), &d).await?;
        }
        Ok(())
    }

    async fn get_docs(&self, user_id: Uuid, ids: &[Uuid]) -> Result<Vec<ChatDoc>> {
        self.find_rows(
            CHAT_DOCS,
            doc! { "_id": { "$in": id_list(ids) }, "keys.user_id": user_id.to_string() },
        )
        .await
    }

    async fn list_docs(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
        doc_types: &[DocType],
    ) -> Result<Vec<ChatDoc>> {
        let filter = with_doc_types(scope_filter(user_id, scope, scope_id), doc_types);
        let mut docs: Vec<ChatDoc> = self.find_rows(CHAT_DOCS, filter).await?;
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
        let filter = with_doc_types(scope_filter(user_id, scope, scope_id), doc_types);
        let docs: Vec<ChatDoc> = self.find_rows(CHAT_DOCS, filter).await?;
        let ids: Vec<Uuid> = docs.iter().map(|d| d.id).collect();
        self.delete_rows(CHAT_DOCS, doc! { "_id": { "$in": id_list(&ids) } })
            .await?;
        Ok(docs)
    }

    async fn delete_thread_docs(&self, thread_id: Uuid, doc_types: &[DocType]) -> Result<Vec<ChatDoc>> {
        let filter = with_doc_types(doc! { "keys.thread_id": thread_id.to_string() }, doc_types);
        let docs: Vec<ChatDoc> = self.find_rows(CHAT_DOCS, filter).await?;
        let ids: Vec<Uuid> = docs.iter().map(|d| d.id).collect();
        self.delete_rows(CHAT_DOCS, doc! { "_id": { "$in": id_list(&ids) } })
            .await?;
        Ok(docs)
    }
}

#[async_trait]
impl SummaryRepository for MongoStore {
    async fn get_node(&self, node_id: Uuid) -> Result<Option<SummaryNode>> {
        self.get_row(SUMMARY_NODES, &node_id.to_string()).await
    }

    async fn list_nodes(&self, thread_id: Uuid) -> Result<Vec<SummaryNode>> {
        let mut nodes: Vec<SummaryNode> = self
            .find_rows(SUMMARY_NODES, doc! { "keys.thread_id": thread_id.to_string() })
            .await?;
        nodes.sort_by_key(|n| (n.level, n.start_seq, n.id));
        Ok(nodes)
    }

    async fn list_orphans(&self, thread_id: Uuid, level: u32) -> Result<Vec<SummaryNode>> {
        let filter = doc! {
            "keys.thread_id": thread_id.to_string(),
            "keys.level": i64::from(level),
            "keys.parent_id": Bson::Null,
        };
        let mut nodes: Vec<SummaryNode> = self.find_rows(SUMMARY_NODES, filter).await?;
        nodes.sort_by_key(|n| (n.start_seq, n.id));
        Ok(nodes)
    }

    async fn insert_node(&self, node: SummaryNode) -> Result<SummaryNode> {
        let keys = summary_keys(&node);
        self.insert_row(SUMMARY_NODES, node.id.to_string(), keys, node).await
    }

    async fn create_parent(&self, parent: SummaryNode) -> Result<SummaryNode> {
        let children: Vec<SummaryNode> = self
            .find_rows(
                SUMMARY_NODES,
                doc! { "_id": { "$in": id_list(&parent.child_node_ids) } },
            )
            .await?;
        for child_id in &parent.child_node_ids {
            let child = children
                .iter()
                .find(|c| c.id == *child_id)
                .ok_or(PersistError::NotFound {
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

        // Parent ids are derived from their children, so a replay after a partial
        // write converges on the same rows.
        let keys = summary_keys(&parent);
        let stored = self
            .insert_row(SUMMARY_NODES, parent.id.to_string(), keys, parent)
            .await?;
        let now = Utc::now();
        for mut child in children {
            child.parent_id = Some(stored.id);
            child.updated_at = now;
            self.put_summary(&child).await?;
        }
        Ok(stored)
    }

    async fn delete_nodes(&self, thread_id: Uuid) -> Result<usize> {
        let deleted = self
            .delete_rows(SUMMARY_NODES, doc! { "keys.thread_id": thread_id.to_string() })
            .await?;
        Ok(deleted as usize)
    }
}

#[async_trait]
impl ChatGraphRepository for MongoStore {
    async fn upsert_entity(&self, entity: ChatEntity) -> Result<ChatEntity> {
        let mut filter = scope_filter(entity.user_id, entity.scope, entity.scope_id);
        filter.insert("keys.canonical_name", entity.canonical_name.as_str());
        let existing: Option<ChatEntity> = self.find_rows(ENTITIES, filter).await?.into_iter().next();

        let merged = match existing {
            Some(mut row) => {
                merge_seqs(&mut row.evidence_seqs, &entity.evidence_seqs);
                for alias in entity.aliases {
                    if !row.aliases.contains(&alias) {
                        row.aliases.push(alias);
                    }
                }
                if !entity.description.trim().is_empty() {
                    row.description = entity.description;
                }
                if row.entity_type.is_empty() {
                    row.entity_type = entity.entity_type;
                }
                row.updated_at = Utc::now();
                row
            }
            None => entity,
        };

        let mut keys = scope_keys(merged.user_id, merged.scope, merged.scope_id);
        keys.insert("canonical_name", merged.canonical_name.as_str());
        self.put_row(ENTITIES, merged.id.to_string(), keys, &merged).await?;
        Ok(merged)
    }

    async fn insert_edge(&self, edge: ChatEdge) -> Result<()> {
        let merged = match self.get_row::<ChatEdge>(EDGES, &edge.id.to_string()).await? {
            Some(mut row) => {
                merge_seqs(&mut row.evidence_seqs, &edge.evidence_seqs);
                row
            }
            None => edge,
        };
        let keys = scope_keys(merged.user_id, merged.scope, merged.scope_id);
        self.put_row(EDGES, merged.id.to_string(), keys, &merged).await
    }

    async fn insert_claim(&self, claim: ChatClaim) -> Result<()> {
        let merged = match self.get_row::<ChatClaim>(CLAIMS, &claim.id.to_string()).await? {
            Some(mut row) => {
                merge_seqs(&mut row.evidence_seqs, &claim.evidence_seqs);
                row
            }
            None => claim,
        };
        let keys = scope_keys(merged.user_id, merged.scope, merged.scope_id);
        self.put_row(CLAIMS, merged.id.to_string(), keys, &merged).await
    }

    async fn list_entities(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatEntity>> {
        let mut rows: Vec<ChatEntity> = self
            .find_rows(ENTITIES, scope_filter(user_id, scope, scope_id))
            .await?;
        rows.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));
        Ok(rows)
    }

    async fn list_edges(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatEdge>> {
        let mut rows: Vec<ChatEdge> = self
            .find_rows(EDGES, scope_filter(user_id, scope, scope_id))
            .await?;
        rows.sort_by_key(|e| e.id);
        Ok(rows)
    }

    async fn list_claims(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatClaim>> {
        let mut rows: Vec<ChatClaim> = self
            .find_rows(CLAIMS, scope_filter(user_id, scope, scope_id))
            .await?;
        rows.sort_by_key(|c| c.id);
        Ok(rows)
    }

    async fn delete_graph(&self, user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Result<()> {
        for collection in [ENTITIES, EDGES, CLAIMS] {
            self.delete_rows(collection, scope_filter(user_id, scope, scope_id))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryItemRepository for MongoStore {
    async fn upsert_item(&self, item: ChatMemoryItem) -> Result<ChatMemoryItem> {
        let mut filter = scope_filter(item.user_id, item.scope, item.scope_id);
        filter.insert("keys.kind", item.kind.as_str());
        filter.insert("keys.key", item.key.to_lowercase());
        filter.insert("keys.deleted", false);
        let existing: Option<ChatMemoryItem> =
            self.find_rows(MEMORY_ITEMS, filter).await?.into_iter().next();

        let stored = match existing {
            Some(mut row) => {
                row.value = item.value;
                row.confidence = item.confidence;
                row.evidence_seqs = item.evidence_seqs;
                row.updated_at = Utc::now();
                row
            }
            None => item,
        };
        self.put_row(MEMORY_ITEMS, stored.id.to_string(), memory_keys(&stored), &stored)
            .await?;
        Ok(stored)
    }

    async fn list_items(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatMemoryItem>> {
        let mut filter = scope_filter(user_id, scope, scope_id);
        filter.insert("keys.deleted", false);
        let mut rows: Vec<ChatMemoryItem> = self.find_rows(MEMORY_ITEMS, filter).await?;
        rows.sort_by(|a, b| (a.kind.as_str(), &a.key).cmp(&(b.kind.as_str(), &b.key)));
        Ok(rows)
    }

    async fn delete_items(&self, user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Result<usize> {
        let live = self.list_items(user_id, scope, scope_id).await?;
        let now = Utc::now();
        let count = live.len();
        for mut item in live {
            item.deleted_at = Some(now);
            self.put_row(MEMORY_ITEMS, item.id.to_string(), memory_keys(&item), &item)
                .await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl PathRepository for MongoStore {
    async fn get_path(&self, path_id: Uuid) -> Result<Option<LearningPath>> {
        self.get_row(PATHS, &path_id.to_string()).await
    }

    async fn list_nodes(&self, path_id: Uuid) -> Result<Vec<PathNode>> {
        let mut nodes: Vec<PathNode> = self
            .find_rows(PATH_NODES, doc! { "keys.path_id": path_id.to_string() })
            .await?;
        nodes.sort_by_key(|n| (n.parent_id, n.index, n.id));
        Ok(nodes)
    }

    async fn get_node_doc(&self, node_id: Uuid) -> Result<Option<NodeDoc>> {
        Ok(self
            .find_rows(NODE_DOCS, doc! { "keys.node_id": node_id.to_string() })
            .await?
            .into_iter()
            .next())
    }

    async fn list_node_docs(&self, path_id: Uuid) -> Result<Vec<NodeDoc>> {
        let mut docs: Vec<NodeDoc> = self
            .find_rows(NODE_DOCS, doc! { "keys.path_id": path_id.to_string() })
            .await?;
        docs.sort_by_key(|d| d.node_id);
        Ok(docs)
    }

    async fn list_concepts(&self, path_id: Uuid) -> Result<Vec<Concept>> {
        let mut concepts: Vec<Concept> = self
            .find_rows(CONCEPTS, doc! { "keys.path_id": path_id.to_string() })
            .await?;
        concepts.sort_by(|a, b| (a.depth, &a.key).cmp(&(b.depth, &b.key)));
        Ok(concepts)
    }

    async fn list_concept_edges(&self, path_id: Uuid) -> Result<Vec<ConceptEdge>> {
        self.find_rows(CONCEPT_EDGES, doc! { "keys.path_id": path_id.to_string() })
            .await
    }

    async fn list_material_files(&self, material_set_id: Uuid) -> Result<Vec<MaterialFile>> {
        let mut files: Vec<MaterialFile> = self
            .find_rows(MATERIAL_FILES, doc! { "keys.material_set_id": material_set_id.to_string() })
            .await?;
        files.sort_by(|a, b| a.original_name.cmp(&b.original_name));
        Ok(files)
    }

    async fn list_material_chunks(&self, material_set_id: Uuid) -> Result<Vec<MaterialChunk>> {
        let mut chunks: Vec<MaterialChunk> = self
            .find_rows(MATERIAL_CHUNKS, doc! { "keys.material_set_id": material_set_id.to_string() })
            .await?;
        chunks.sort_by_key(|c| (c.material_file_id, c.index));
        Ok(chunks)
    }

    async fn get_material_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<MaterialChunk>> {
        self.find_rows(MATERIAL_CHUNKS, doc! { "_id": { "$in": id_list(chunk_ids) } })
            .await
    }

    async fn search_material_chunks(
        &self,
        material_set_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(MaterialChunk, f32)>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<(MaterialChunk, f32)> = self
            .list_material_chunks(material_set_id)
            .await?
            .into_iter()
            .map(|c| {
                let score = match_score(&query_terms, &c.text);
                (c, score)
            })
            .filter(|(_, s)| *s > 0.0)
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
        self.find_rows(
            CONCEPT_EVIDENCE,
            doc! { "keys.material_chunk_id": { "$in": id_list(chunk_ids) } },
        )
        .await
    }

    async fn evidence_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>> {
        self.find_rows(
            CONCEPT_EVIDENCE,
            doc! { "keys.concept_id": { "$in": id_list(concept_ids) } },
        )
        .await
    }

    async fn get_session_state(&self, user_id: Uuid) -> Result<Option<UserSessionState>> {
        self.get_row(SESSION_STATES, &user_id.to_string()).await
    }

    async fn put_session_state(&self, state: UserSessionState) -> Result<()> {
        self.put_row(SESSION_STATES, state.user_id.to_string(), Document::new(), &state)
            .await
    }

    async fn list_concept_states(
        &self,
        user_id: Uuid,
        concept_ids: &[Uuid],
    ) -> Result<Vec<UserConceptState>> {
        self.find_rows(
            CONCEPT_STATES,
            doc! {
                "keys.user_id": user_id.to_string(),
                "keys.concept_id": { "$in": id_list(concept_ids) },
            },
        )
        .await
    }
}
