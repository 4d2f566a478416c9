use async_trait::async_trait;
use chrono::Utc;
use lumen_llm::JsonSchema;
use lumen_types::ids::{self, CHAT_DOC_VERSION};
use lumen_types::{ChatDoc, ChatMemoryItem, ChatMessage, Cursor, DocType, MemoryKind, Scope};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{evidence_in, transcript, Phase, PhaseContext, PhaseOutcome};
use crate::error::{EngineError, Result};
use crate::prompts::MEMORY_EXTRACT_SYSTEM_PROMPT;

const MESSAGE_CHARS: usize = 1200;

fn memory_schema() -> JsonSchema {
    JsonSchema::new(
        "memory_items",
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["items"],
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["kind", "scope", "key", "value", "confidence", "evidence_seqs"],
                        "properties": {
                            "kind": {"type": "string", "enum": ["fact", "preference", "decision", "todo"]},
                            "scope": {"type": "string", "enum": ["user", "path", "thread"]},
                            "key": {"type": "string"},
                            "value": {"type": "string"},
                            "confidence": {"type": "number"},
                            "evidence_seqs": {"type": "array", "items": {"type": "integer"}}
                        }
                    }
                }
            }
        }),
    )
}

/// Where an extracted item lives; path items fall back to the thread without a path
fn resolve_scope(raw: &str, thread_id: Uuid, path_id: Option<Uuid>) -> (Scope, Option<Uuid>) {
    match Scope::parse(raw) {
        Some(Scope::User) => (Scope::User, None),
        Some(Scope::Path) => match path_id {
            Some(path_id) => (Scope::Path, Some(path_id)),
            None => (Scope::Thread, Some(thread_id)),
        },
        _ => (Scope::Thread, Some(thread_id)),
    }
}

/// Durable facts, preferences, decisions and todos about the learner
pub struct MemoryPhase;

impl MemoryPhase {
    fn item_from(&self, ctx: &PhaseContext, raw: &Value, batch: &[ChatMessage]) -> Option<ChatMemoryItem> {
        let kind = raw.get("kind").and_then(Value::as_str).and_then(MemoryKind::parse)?;
        let key = raw.get("key").and_then(Value::as_str).map(str::trim).filter(|k| !k.is_empty())?;
        let value = raw.get("value").and_then(Value::as_str).map(str::trim).filter(|v| !v.is_empty())?;
        let (scope, scope_id) = resolve_scope(
            raw.get("scope").and_then(Value::as_str).unwrap_or_default(),
            ctx.thread.id,
            ctx.thread.path_id,
        );
        let now = Utc::now();
        Some(ChatMemoryItem {
            id: ids::memory_item_id(ctx.user_id(), scope, scope_id, kind.as_str(), key),
            user_id: ctx.user_id(),
            scope,
            scope_id,
            thread_id: Some(ctx.thread.id),
            kind,
            key: key.to_string(),
            value: value.to_string(),
            confidence: raw
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c.clamp(0.0, 1.0) as f32)
                .unwrap_or(0.5),
            evidence_seqs: evidence_in(raw.get("evidence_seqs"), batch),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    fn memory_doc(&self, ctx: &PhaseContext, item: &ChatMemoryItem) -> ChatDoc {
        let text = format!("Memory ({}): {} = {}", item.kind.as_str(), item.key, item.value);
        let mut doc = ChatDoc::projected(
            item.user_id,
            DocType::Memory,
            item.scope,
            item.scope_id,
            item.id,
            0,
            CHAT_DOC_VERSION,
            text,
        );
        if let Some(seq) = item.evidence_seqs.last() {
            doc = doc.at_seq(*seq);
        }
        match item.scope {
            Scope::Thread => doc = doc.in_thread(ctx.thread.id),
            Scope::Path => {
                if let Some(path_id) = item.scope_id {
                    doc = doc.in_path(path_id);
                }
            }
            Scope::User => {}
        }
        doc
    }
}

#[async_trait]
impl Phase for MemoryPhase {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn cursor(&self) -> Cursor {
        Cursor::Memory
    }

    async fn run(&self, ctx: &PhaseContext, cursor: i64) -> Result<PhaseOutcome> {
        let window = ctx.window(cursor).await?;
        let messages: Vec<ChatMessage> = window
            .messages
            .into_iter()
            .filter(|m| !m.is_deleted() && !m.content.trim().is_empty())
            .collect();

        let mut docs = Vec::new();
        let mut skipped = 0;
        for batch in messages.chunks(ctx.config.extract_window.max(1)) {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let input = format!("Conversation excerpt:\n{}", transcript(batch, MESSAGE_CHARS));
            let value = match ctx.generate_json(MEMORY_EXTRACT_SYSTEM_PROMPT, input, memory_schema()).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        phase = "memory",
                        thread_id = %ctx.thread.id,
                        from_seq = batch.first().map(|m| m.seq).unwrap_or_default(),
                        to_seq = batch.last().map(|m| m.seq).unwrap_or_default(),
                        error = %e,
                        "memory extraction failed; skipping window"
                    );
                    skipped += 1;
                    continue;
                }
            };
            let items = value.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
            for raw in &items {
                let Some(item) = self.item_from(ctx, raw, batch) else {
                    debug!(item = %raw, "dropping malformed memory item");
                    continue;
                };
                let stored = ctx.stores.memory.upsert_item(item).await?;
                docs.push(self.memory_doc(ctx, &stored));
            }
        }

        ctx.embed_docs(&mut docs).await;
        let written = ctx.project(docs).await?;
        Ok(PhaseOutcome {
            up_to: window.up_to,
            written,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_resolution() {
        let thread = Uuid::new_v4();
        let path = Uuid::new_v4();
        assert_eq!(resolve_scope("user", thread, Some(path)), (Scope::User, None));
        assert_eq!(resolve_scope("path", thread, Some(path)), (Scope::Path, Some(path)));
        assert_eq!(resolve_scope("path", thread, None), (Scope::Thread, Some(thread)));
        assert_eq!(resolve_scope("bogus", thread, None), (Scope::Thread, Some(thread)));
    }
}
