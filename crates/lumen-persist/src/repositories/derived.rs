use async_trait::async_trait;
use lumen_types::{
    ChatClaim, ChatDoc, ChatEdge, ChatEntity, ChatMemoryItem, DocType, Scope, SummaryNode,
};
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait ChatDocRepository: Send + Sync {
    /// Insert or replace by id; `created_at` of an existing row is preserved
    async fn upsert_docs(&self, docs: Vec<ChatDoc>) -> Result<()>;

    /// Rows whose id is in `ids` and that belong to `user_id`
    async fn get_docs(&self, user_id: Uuid, ids: &[Uuid]) -> Result<Vec<ChatDoc>>;

    async fn list_docs(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
        doc_types: &[DocType],
    ) -> Result<Vec<ChatDoc>>;

    /// Delete and return the matching rows so callers can purge their vectors
    async fn delete_docs(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
        doc_types: &[DocType],
    ) -> Result<Vec<ChatDoc>>;

    /// Delete every row of `doc_types` attached to a thread, whatever its scope
    async fn delete_thread_docs(&self, thread_id: Uuid, doc_types: &[DocType]) -> Result<Vec<ChatDoc>>;
}

#[async_trait]
pub trait SummaryRepository: Send + Sync {
    async fn get_node(&self, node_id: Uuid) -> Result<Option<SummaryNode>>;

    async fn list_nodes(&self, thread_id: Uuid) -> Result<Vec<SummaryNode>>;

    /// Nodes at `level` without a parent, ascending by `start_seq`
    async fn list_orphans(&self, thread_id: Uuid, level: u32) -> Result<Vec<SummaryNode>>;

    /// Insert unless a node with the same id exists; returns the stored node
    async fn insert_node(&self, node: SummaryNode) -> Result<SummaryNode>;

    /// Insert `parent` and set `parent_id` on each child in one transaction
    async fn create_parent(&self, parent: SummaryNode) -> Result<SummaryNode>;

    async fn delete_nodes(&self, thread_id: Uuid) -> Result<usize>;
}

#[async_trait]
pub trait ChatGraphRepository: Send + Sync {
    /// Merge by (user, scope, scope_id, canonical_name); evidence and aliases are unioned
    async fn upsert_entity(&self, entity: ChatEntity) -> Result<ChatEntity>;

    /// Idempotent by id
    async fn insert_edge(&self, edge: ChatEdge) -> Result<()>;

    /// Idempotent by id
    async fn insert_claim(&self, claim: ChatClaim) -> Result<()>;

    async fn list_entities(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatEntity>>;

    async fn list_edges(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatEdge>>;

    async fn list_claims(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatClaim>>;

    async fn delete_graph(&self, user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Result<()>;
}

#[async_trait]
pub trait MemoryItemRepository: Send + Sync {
    /// Upsert on (user, scope, scope_id, kind, key) among non-deleted rows
    async fn upsert_item(&self, item: ChatMemoryItem) -> Result<ChatMemoryItem>;

    async fn list_items(
        &self,
        user_id: Uuid,
        scope: Scope,
        scope_id: Option<Uuid>,
    ) -> Result<Vec<ChatMemoryItem>>;

    /// Soft-delete every item of a scope
    async fn delete_items(&self, user_id: Uuid, scope: Scope, scope_id: Option<Uuid>) -> Result<usize>;
}
