use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    UnitBlock,
    Doc,
    MaterialChunk,
}

/// Labeled passage eligible to ground citations and verbatim quotes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSource {
    /// Identifier the model cites as `[[source:ID]]`
    pub id: String,
    pub kind: EvidenceKind,
    pub label: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_sec: Option<f64>,
}

impl EvidenceSource {
    pub fn new(id: impl Into<String>, kind: EvidenceKind, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            text: text.into(),
            doc_id: None,
            block_id: None,
            file_name: None,
            page: None,
            start_sec: None,
        }
    }

    pub fn is_material(&self) -> bool {
        self.kind == EvidenceKind::MaterialChunk
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceCitation {
    pub source_id: String,
    pub kind: EvidenceKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_sec: Option<f64>,
}

impl From<&EvidenceSource> for EvidenceCitation {
    fn from(source: &EvidenceSource) -> Self {
        Self {
            source_id: source.id.clone(),
            kind: source.kind,
            label: source.label.clone(),
            file_name: source.file_name.clone(),
            page: source.page,
            start_sec: source.start_sec,
        }
    }
}

/// Metadata persisted on a finalized assistant message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMetadata {
    #[serde(default)]
    pub citations: Vec<EvidenceCitation>,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub quote_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<serde_json::Value>,
}
