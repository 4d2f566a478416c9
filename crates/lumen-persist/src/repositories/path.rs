use async_trait::async_trait;
use lumen_types::{
    Concept, ConceptEdge, ConceptEvidence, LearningPath, MaterialChunk, MaterialFile, NodeDoc,
    PathNode, UserConceptState, UserSessionState,
};
use uuid::Uuid;

use crate::error::Result;

/// Read access to authored path content, plus the per-user session row
#[async_trait]
pub trait PathRepository: Send + Sync {
    async fn get_path(&self, path_id: Uuid) -> Result<Option<LearningPath>>;

    /// Ordered by (parent, index)
    async fn list_nodes(&self, path_id: Uuid) -> Result<Vec<PathNode>>;

    async fn get_node_doc(&self, node_id: Uuid) -> Result<Option<NodeDoc>>;

    async fn list_node_docs(&self, path_id: Uuid) -> Result<Vec<NodeDoc>>;

    async fn list_concepts(&self, path_id: Uuid) -> Result<Vec<Concept>>;

    async fn list_concept_edges(&self, path_id: Uuid) -> Result<Vec<ConceptEdge>>;

    async fn list_material_files(&self, material_set_id: Uuid) -> Result<Vec<MaterialFile>>;

    async fn list_material_chunks(&self, material_set_id: Uuid) -> Result<Vec<MaterialChunk>>;

    async fn get_material_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<MaterialChunk>>;

    /// Full-text search over chunk text, best match first
    async fn search_material_chunks(
        &self,
        material_set_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(MaterialChunk, f32)>>;

    async fn evidence_for_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>>;

    async fn evidence_for_concepts(&self, concept_ids: &[Uuid]) -> Result<Vec<ConceptEvidence>>;

    async fn get_session_state(&self, user_id: Uuid) -> Result<Option<UserSessionState>>;

    async fn put_session_state(&self, state: UserSessionState) -> Result<()>;

    async fn list_concept_states(
        &self,
        user_id: Uuid,
        concept_ids: &[Uuid],
    ) -> Result<Vec<UserConceptState>>;
}
