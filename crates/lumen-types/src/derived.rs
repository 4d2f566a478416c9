use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::projection::Scope;

/// Node in a thread's RAPTOR summary forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryNode {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub parent_id: Option<Uuid>,
    /// 0 for leaves
    pub level: u32,
    pub start_seq: i64,
    pub end_seq: i64,
    pub summary_md: String,
    #[serde(default)]
    pub child_node_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SummaryNode {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: Scope,
    pub scope_id: Option<Uuid>,
    pub name: String,
    /// Lowercased name; unique per (user, scope, scope_id)
    pub canonical_name: String,
    pub entity_type: String,
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub evidence_seqs: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEdge {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: Scope,
    pub scope_id: Option<Uuid>,
    pub src_entity_id: Uuid,
    pub dst_entity_id: Uuid,
    pub relation: String,
    pub weight: f32,
    #[serde(default)]
    pub evidence_seqs: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatClaim {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: Scope,
    pub scope_id: Option<Uuid>,
    pub thread_id: Option<Uuid>,
    pub content: String,
    #[serde(default)]
    pub entity_ids: Vec<Uuid>,
    pub confidence: f32,
    #[serde(default)]
    pub evidence_seqs: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Fact,
    Preference,
    Decision,
    Todo,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Fact => "fact",
            MemoryKind::Preference => "preference",
            MemoryKind::Decision => "decision",
            MemoryKind::Todo => "todo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fact" => Some(MemoryKind::Fact),
            "preference" => Some(MemoryKind::Preference),
            "decision" => Some(MemoryKind::Decision),
            "todo" => Some(MemoryKind::Todo),
            _ => None,
        }
    }
}

/// Durable memory; unique per `(user, scope, scope_id, kind, key)` among non-deleted rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMemoryItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: Scope,
    pub scope_id: Option<Uuid>,
    pub thread_id: Option<Uuid>,
    pub kind: MemoryKind,
    pub key: String,
    pub value: String,
    pub confidence: f32,
    #[serde(default)]
    pub evidence_seqs: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChatMemoryItem {
    pub fn same_key(&self, other: &ChatMemoryItem) -> bool {
        self.user_id == other.user_id
            && self.scope == other.scope
            && self.scope_id == other.scope_id
            && self.kind == other.kind
            && self.key.eq_ignore_ascii_case(&other.key)
    }
}
