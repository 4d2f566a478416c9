use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids;

/// Visibility namespace for a projection row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Thread,
    Path,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Thread => "thread",
            Scope::Path => "path",
            Scope::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thread" => Some(Scope::Thread),
            "path" => Some(Scope::Path),
            "user" => Some(Scope::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    MessageChunk,
    Summary,
    Memory,
    Entity,
    Claim,
    PathOverview,
    PathNode,
    PathConcepts,
    PathMaterials,
    PathUnitDoc,
    PathUnitBlock,
}

impl DocType {
    pub const PATH_FAMILY: [DocType; 6] = [
        DocType::PathOverview,
        DocType::PathNode,
        DocType::PathConcepts,
        DocType::PathMaterials,
        DocType::PathUnitDoc,
        DocType::PathUnitBlock,
    ];

    /// Derived from the thread's chat log; wiped by a rebuild
    pub const THREAD_DERIVED: [DocType; 5] = [
        DocType::MessageChunk,
        DocType::Summary,
        DocType::Memory,
        DocType::Entity,
        DocType::Claim,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::MessageChunk => "message_chunk",
            DocType::Summary => "summary",
            DocType::Memory => "memory",
            DocType::Entity => "entity",
            DocType::Claim => "claim",
            DocType::PathOverview => "path_overview",
            DocType::PathNode => "path_node",
            DocType::PathConcepts => "path_concepts",
            DocType::PathMaterials => "path_materials",
            DocType::PathUnitDoc => "path_unit_doc",
            DocType::PathUnitBlock => "path_unit_block",
        }
    }

    pub fn is_path_doc(&self) -> bool {
        Self::PATH_FAMILY.contains(self)
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval projection row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDoc {
    pub id: Uuid,
    pub user_id: Uuid,
    pub doc_type: DocType,
    pub scope: Scope,
    pub scope_id: Option<Uuid>,
    pub thread_id: Option<Uuid>,
    pub path_id: Option<Uuid>,
    pub source_id: Option<Uuid>,
    pub source_seq: Option<i64>,
    pub chunk_index: u32,
    pub text: String,
    pub contextual_text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub vector_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatDoc {
    /// Build a row whose id and vector id are derived from `(doc_type, source_id, chunk_index, version)`
    #[allow(clippy::too_many_arguments)]
    pub fn projected(
        user_id: Uuid,
        doc_type: DocType,
        scope: Scope,
        scope_id: Option<Uuid>,
        source_id: Uuid,
        chunk_index: u32,
        version: u32,
        text: impl Into<String>,
    ) -> Self {
        let id = ids::chat_doc_id(doc_type, source_id, chunk_index, version);
        let text = text.into();
        let now = Utc::now();
        Self {
            id,
            user_id,
            doc_type,
            scope,
            scope_id,
            thread_id: None,
            path_id: None,
            source_id: Some(source_id),
            source_seq: None,
            chunk_index,
            contextual_text: text.clone(),
            text,
            embedding: Vec::new(),
            vector_id: ids::vector_id(id),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_thread(mut self, thread_id: Uuid) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn in_path(mut self, path_id: Uuid) -> Self {
        self.path_id = Some(path_id);
        self
    }

    pub fn at_seq(mut self, seq: i64) -> Self {
        self.source_seq = Some(seq);
        self
    }

    pub fn with_contextual_text(mut self, contextual: impl Into<String>) -> Self {
        self.contextual_text = contextual.into();
        self
    }

    /// Text used for embedding and display, preferring the contextual rewrite
    pub fn retrieval_text(&self) -> &str {
        if self.contextual_text.trim().is_empty() {
            &self.text
        } else {
            &self.contextual_text
        }
    }
}
