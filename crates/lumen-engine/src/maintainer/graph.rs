use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use lumen_llm::JsonSchema;
use lumen_types::ids::{self, CHAT_DOC_VERSION};
use lumen_types::{ChatClaim, ChatDoc, ChatEdge, ChatEntity, ChatMessage, Cursor, DocType, Scope};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::{evidence_in, transcript, Phase, PhaseContext, PhaseOutcome};
use crate::error::{EngineError, Result};
use crate::prompts::GRAPH_EXTRACT_SYSTEM_PROMPT;

const MESSAGE_CHARS: usize = 1200;

fn graph_schema() -> JsonSchema {
    let seqs = json!({"type": "array", "items": {"type": "integer"}});
    JsonSchema::new(
        "chat_graph",
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["entities", "relations", "claims"],
            "properties": {
                "entities": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["name", "type", "description", "aliases", "evidence_seqs"],
                        "properties": {
                            "name": {"type": "string"},
                            "type": {"type": "string"},
                            "description": {"type": "string"},
                            "aliases": {"type": "array", "items": {"type": "string"}},
                            "evidence_seqs": seqs
                        }
                    }
                },
                "relations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["src", "dst", "relation", "weight", "evidence_seqs"],
                        "properties": {
                            "src": {"type": "string"},
                            "dst": {"type": "string"},
                            "relation": {"type": "string"},
                            "weight": {"type": "number"},
                            "evidence_seqs": seqs
                        }
                    }
                },
                "claims": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["content", "entities", "confidence", "evidence_seqs"],
                        "properties": {
                            "content": {"type": "string"},
                            "entities": {"type": "array", "items": {"type": "string"}},
                            "confidence": {"type": "number"},
                            "evidence_seqs": seqs
                        }
                    }
                }
            }
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
struct Extraction {
    #[serde(default)]
    entities: Vec<serde_json::Value>,
    #[serde(default)]
    relations: Vec<serde_json::Value>,
    #[serde(default)]
    claims: Vec<serde_json::Value>,
}

fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).map(str::trim).unwrap_or_default()
}

fn num_field(value: &serde_json::Value, key: &str, default: f32) -> f32 {
    value
        .get(key)
        .and_then(|v| v.as_f64())
        .map(|v| v.clamp(0.0, 1.0) as f32)
        .unwrap_or(default)
}

/// Extracts entities, relations and claims from message batches
pub struct GraphPhase;

impl GraphPhase {
    async fn extract_batch(
        &self,
        ctx: &PhaseContext,
        batch: &[ChatMessage],
        known: &mut HashMap<String, Uuid>,
        docs: &mut Vec<ChatDoc>,
    ) -> Result<bool> {
        let input = format!("Conversation excerpt:\n{}", transcript(batch, MESSAGE_CHARS));
        let value = match ctx.generate_json(GRAPH_EXTRACT_SYSTEM_PROMPT, input, graph_schema()).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    phase = "graph",
                    thread_id = %ctx.thread.id,
                    from_seq = batch.first().map(|m| m.seq).unwrap_or_default(),
                    to_seq = batch.last().map(|m| m.seq).unwrap_or_default(),
                    error = %e,
                    "graph extraction failed; skipping window"
                );
                return Ok(false);
            }
        };
        let extraction: Extraction = serde_json::from_value(value).unwrap_or_default();

        let user_id = ctx.user_id();
        let scope_id = Some(ctx.thread.id);
        let now = Utc::now();

        for raw in &extraction.entities {
            let name = str_field(raw, "name");
            if name.is_empty() {
                continue;
            }
            let aliases: Vec<String> = raw
                .get("aliases")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|a| a.as_str())
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let entity = ChatEntity {
                id: ids::entity_id(user_id, Scope::Thread, scope_id, name),
                user_id,
                scope: Scope::Thread,
                scope_id,
                name: name.to_string(),
                canonical_name: ids::canonical_name(name),
                entity_type: str_field(raw, "type").to_lowercase(),
                description: str_field(raw, "description").to_string(),
                aliases,
                evidence_seqs: evidence_in(raw.get("evidence_seqs"), batch),
                created_at: now,
                updated_at: now,
            };
            let stored = ctx.stores.graph.upsert_entity(entity).await?;
            known.insert(stored.canonical_name.clone(), stored.id);
            for alias in &stored.aliases {
                known.entry(ids::canonical_name(alias)).or_insert(stored.id);
            }
            docs.push(self.entity_doc(ctx, &stored));
        }

        for raw in &extraction.relations {
            let src = known.get(&ids::canonical_name(str_field(raw, "src"))).copied();
            let dst = known.get(&ids::canonical_name(str_field(raw, "dst"))).copied();
            let relation = str_field(raw, "relation").to_lowercase();
            let (Some(src), Some(dst)) = (src, dst) else {
                continue;
            };
            if relation.is_empty() || src == dst {
                continue;
            }
            ctx.stores
                .graph
                .insert_edge(ChatEdge {
                    id: ids::edge_id(src, &relation, dst),
                    user_id,
                    scope: Scope::Thread,
                    scope_id,
                    src_entity_id: src,
                    dst_entity_id: dst,
                    relation,
                    weight: num_field(raw, "weight", 0.5),
                    evidence_seqs: evidence_in(raw.get("evidence_seqs"), batch),
                    created_at: now,
                })
                .await?;
        }

        for raw in &extraction.claims {
            let content = str_field(raw, "content");
            if content.is_empty() {
                continue;
            }
            let entity_ids: Vec<Uuid> = raw
                .get("entities")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|n| n.as_str())
                        .filter_map(|n| known.get(&ids::canonical_name(n)).copied())
                        .collect()
                })
                .unwrap_or_default();
            let claim = ChatClaim {
                id: ids::claim_id(user_id, Scope::Thread, scope_id, content),
                user_id,
                scope: Scope::Thread,
                scope_id,
                thread_id: Some(ctx.thread.id),
                content: content.to_string(),
                entity_ids,
                confidence: num_field(raw, "confidence", 0.5),
                evidence_seqs: evidence_in(raw.get("evidence_seqs"), batch),
                created_at: now,
            };
            docs.push(self.claim_doc(ctx, &claim));
            ctx.stores.graph.insert_claim(claim).await?;
        }
        Ok(true)
    }

    fn entity_doc(&self, ctx: &PhaseContext, entity: &ChatEntity) -> ChatDoc {
        let mut text = format!("Entity: {}", entity.name);
        if !entity.entity_type.is_empty() {
            text.push_str(&format!(" ({})", entity.entity_type));
        }
        if !entity.description.is_empty() {
            text.push_str(&format!("\n{}", entity.description));
        }
        if !entity.aliases.is_empty() {
            text.push_str(&format!("\nAliases: {}", entity.aliases.join(", ")));
        }
        self.project(ctx, DocType::Entity, entity.id, text, entity.evidence_seqs.last().copied())
    }

    fn claim_doc(&self, ctx: &PhaseContext, claim: &ChatClaim) -> ChatDoc {
        self.project(
            ctx,
            DocType::Claim,
            claim.id,
            format!("Claim: {}", claim.content),
            claim.evidence_seqs.last().copied(),
        )
    }

    fn project(&self, ctx: &PhaseContext, doc_type: DocType, source_id: Uuid, text: String, seq: Option<i64>) -> ChatDoc {
        let thread = &ctx.thread;
        let mut doc = ChatDoc::projected(
            thread.user_id,
            doc_type,
            Scope::Thread,
            Some(thread.id),
            source_id,
            0,
            CHAT_DOC_VERSION,
            text,
        )
        .in_thread(thread.id);
        if let Some(seq) = seq {
            doc = doc.at_seq(seq);
        }
        if let Some(path_id) = thread.path_id {
            doc = doc.in_path(path_id);
        }
        doc
    }
}

#[async_trait]
impl Phase for GraphPhase {
    fn name(&self) -> &'static str {
        "graph"
    }

    fn cursor(&self) -> Cursor {
        Cursor::Graph
    }

    async fn run(&self, ctx: &PhaseContext, cursor: i64) -> Result<PhaseOutcome> {
        let window = ctx.window(cursor).await?;
        let messages: Vec<ChatMessage> = window
            .messages
            .into_iter()
            .filter(|m| !m.is_deleted() && !m.content.trim().is_empty())
            .collect();
        if messages.is_empty() {
            return Ok(PhaseOutcome {
                up_to: window.up_to,
                ..Default::default()
            });
        }

        let mut known: HashMap<String, Uuid> = ctx
            .stores
            .graph
            .list_entities(ctx.user_id(), Scope::Thread, Some(ctx.thread.id))
            .await?
            .into_iter()
            .map(|e| (e.canonical_name, e.id))
            .collect();

        let mut docs = Vec::new();
        let mut skipped = 0;
        for batch in messages.chunks(ctx.config.extract_window.max(1)) {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !self.extract_batch(ctx, batch, &mut known, &mut docs).await? {
                skipped += 1;
            }
        }

        // an entity seen in several batches is projected once, with its latest row
        let mut seen = std::collections::HashSet::new();
        docs.reverse();
        docs.retain(|d| seen.insert(d.id));
        docs.reverse();

        ctx.embed_docs(&mut docs).await;
        let written = ctx.project(docs).await?;
        Ok(PhaseOutcome {
            up_to: window.up_to,
            written,
            skipped,
        })
    }
}
