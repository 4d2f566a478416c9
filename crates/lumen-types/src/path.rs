//! Canonical learning-path content read by the planner and the path indexer
//!
//! These rows are authored elsewhere; the engine only reads them (and the
//! per-user session state, which the client reports).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningPath {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub material_set_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathNode {
    pub id: Uuid,
    pub path_id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Position among siblings
    pub index: u32,
    pub title: String,
    #[serde(default)]
    pub goal: String,
    /// `module`, `lesson`, ...
    pub kind: String,
    pub updated_at: DateTime<Utc>,
}

/// Authored unit document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: Uuid,
    pub user_id: Uuid,
    pub path_id: Uuid,
    pub node_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub blocks: Vec<DocBlock>,
    pub updated_at: DateTime<Utc>,
}

impl NodeDoc {
    pub fn block(&self, block_id: &str) -> Option<&DocBlock> {
        self.blocks.iter().find(|b| b.id == block_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocBlock {
    pub id: String,
    /// `heading`, `paragraph`, `code`, `quiz`, ...
    pub block_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: String,
}

impl DocBlock {
    pub fn render(&self) -> String {
        match &self.title {
            Some(title) if !title.trim().is_empty() => format!("{}\n{}", title.trim(), self.body),
            _ => self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: Uuid,
    pub path_id: Uuid,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub parent_id: Option<Uuid>,
    pub depth: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptEdge {
    pub id: Uuid,
    pub path_id: Uuid,
    pub from_concept_id: Uuid,
    pub to_concept_id: Uuid,
    /// `prerequisite`, `related`, `part_of`, ...
    pub edge_type: String,
    pub strength: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialSet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialFile {
    pub id: Uuid,
    pub material_set_id: Uuid,
    pub user_id: Uuid,
    pub original_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialChunk {
    pub id: Uuid,
    pub material_set_id: Uuid,
    pub material_file_id: Uuid,
    pub index: u32,
    pub text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// 1-based page for paged documents
    pub page: Option<u32>,
    /// Start offset in seconds for audio/video transcripts
    pub start_sec: Option<f64>,
    pub end_sec: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl MaterialChunk {
    /// `p. 4` or `t=01:32`, for citations
    pub fn locator(&self) -> Option<String> {
        if let Some(page) = self.page {
            return Some(format!("p. {}", page));
        }
        self.start_sec.map(|s| {
            let total = s.max(0.0) as u64;
            format!("t={:02}:{:02}", total / 60, total % 60)
        })
    }
}

/// Links a concept to material chunks that teach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptEvidence {
    pub id: Uuid,
    pub concept_id: Uuid,
    pub material_chunk_id: Uuid,
    pub weight: f32,
}

/// Client-reported viewing context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default)]
    pub active_path_id: Option<Uuid>,
    #[serde(default)]
    pub active_node_id: Option<Uuid>,
    #[serde(default)]
    pub visible_block_ids: Vec<String>,
    #[serde(default)]
    pub current_block_id: Option<String>,
    #[serde(default)]
    pub scroll_percent: Option<f32>,
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    pub fn is_empty(&self) -> bool {
        self.active_path_id.is_none()
            && self.active_node_id.is_none()
            && self.visible_block_ids.is_empty()
            && self.current_block_id.is_none()
    }
}

/// Last session context stored for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSessionState {
    pub user_id: Uuid,
    pub session: SessionContext,
    pub updated_at: DateTime<Utc>,
}

/// Per-concept knowledge estimate for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConceptState {
    pub user_id: Uuid,
    pub concept_id: Uuid,
    pub mastery: f32,
    pub confidence: f32,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(page: Option<u32>, start: Option<f64>) -> MaterialChunk {
        MaterialChunk {
            id: Uuid::new_v4(),
            material_set_id: Uuid::new_v4(),
            material_file_id: Uuid::new_v4(),
            index: 0,
            text: "x".into(),
            embedding: vec![],
            page,
            start_sec: start,
            end_sec: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_locator_prefers_page() {
        assert_eq!(chunk(Some(4), Some(10.0)).locator().as_deref(), Some("p. 4"));
        assert_eq!(chunk(None, Some(92.4)).locator().as_deref(), Some("t=01:32"));
        assert_eq!(chunk(None, None).locator(), None);
    }
}
