//! Deterministic identifiers
//!
//! Every derived row is keyed by a UUIDv5 over its natural key so that
//! retries and reindexing converge on the same primary keys.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::projection::{DocType, Scope};

/// Bump to invalidate every path projection row on the next index pass
pub const CHAT_PATH_DOC_VERSION: u32 = 3;

/// Version baked into message-chunk, summary, memory and graph projections
pub const CHAT_DOC_VERSION: u32 = 1;

const LUMEN_NAMESPACE: Uuid = Uuid::from_u128(0x4c75_6d65_6e2d_5e1d_8a3c_0b1d_2e3f_4a5b);

/// UUIDv5 over `parts` joined with `|`
pub fn deterministic_id(parts: &[&str]) -> Uuid {
    Uuid::new_v5(&LUMEN_NAMESPACE, parts.join("|").as_bytes())
}

pub fn chat_doc_id(doc_type: DocType, source_id: Uuid, chunk_index: u32, version: u32) -> Uuid {
    deterministic_id(&[
        "chat_doc",
        doc_type.as_str(),
        &source_id.to_string(),
        &chunk_index.to_string(),
        &format!("v{}", version),
    ])
}

pub fn vector_id(doc_id: Uuid) -> String {
    format!("chat_doc:{}", doc_id)
}

/// Inverse of [`vector_id`]
pub fn doc_id_from_vector_id(vector_id: &str) -> Option<Uuid> {
    vector_id
        .strip_prefix("chat_doc:")
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

pub fn summary_leaf_id(thread_id: Uuid, start_seq: i64, end_seq: i64) -> Uuid {
    deterministic_id(&[
        "summary",
        &thread_id.to_string(),
        "0",
        &format!("{}..{}", start_seq, end_seq),
    ])
}

/// Parent id over the sorted child list, so cluster order does not matter
pub fn summary_parent_id(thread_id: Uuid, level: u32, child_ids: &[Uuid]) -> Uuid {
    let mut sorted: Vec<String> = child_ids.iter().map(|c| c.to_string()).collect();
    sorted.sort();
    deterministic_id(&[
        "summary",
        &thread_id.to_string(),
        &level.to_string(),
        &sorted.join(","),
    ])
}

fn scope_key(scope: Scope, scope_id: Option<Uuid>) -> String {
    match scope_id {
        Some(id) => format!("{}:{}", scope.as_str(), id),
        None => scope.as_str().to_string(),
    }
}

pub fn entity_id(user_id: Uuid, scope: Scope, scope_id: Option<Uuid>, name: &str) -> Uuid {
    deterministic_id(&[
        "entity",
        &user_id.to_string(),
        &scope_key(scope, scope_id),
        &canonical_name(name),
    ])
}

pub fn edge_id(src: Uuid, relation: &str, dst: Uuid) -> Uuid {
    deterministic_id(&[
        "edge",
        &src.to_string(),
        &relation.trim().to_lowercase(),
        &dst.to_string(),
    ])
}

pub fn claim_id(user_id: Uuid, scope: Scope, scope_id: Option<Uuid>, content: &str) -> Uuid {
    deterministic_id(&[
        "claim",
        &user_id.to_string(),
        &scope_key(scope, scope_id),
        &canonical_name(content),
    ])
}

pub fn memory_item_id(
    user_id: Uuid,
    scope: Scope,
    scope_id: Option<Uuid>,
    kind: &str,
    key: &str,
) -> Uuid {
    deterministic_id(&[
        "memory",
        &user_id.to_string(),
        &scope_key(scope, scope_id),
        kind,
        &canonical_name(key),
    ])
}

/// Lowercased, whitespace-collapsed form used for entity canonicalization
pub fn canonical_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Vector namespace for a user's chat projections
pub fn user_namespace(user_id: Uuid) -> String {
    format!("chat_u{}", short_hash(&user_id.to_string()))
}

/// Vector namespace for the chunks of a material set
pub fn material_namespace(material_set_id: Uuid) -> String {
    format!("mat_s{}", short_hash(&material_set_id.to_string()))
}
