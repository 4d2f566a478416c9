use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lumen_llm::JsonSchema;
use lumen_types::ids::CHAT_DOC_VERSION;
use lumen_types::{ChatDoc, ChatMessage, Cursor, DocType, MessageStatus, Scope};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{truncate_chars, Phase, PhaseContext, PhaseOutcome};
use crate::error::Result;
use crate::prompts::CONTEXTUALIZE_SYSTEM_PROMPT;

const CONTEXT_PREFIX_CHARS: usize = 1200;

/// Split `text` into pieces of at most `max_chars` characters, preferring whitespace breaks
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some((hard, _)) = rest.char_indices().nth(max_chars) else {
            chunks.push(rest.to_string());
            break;
        };
        let cut = rest[..hard]
            .rfind(char::is_whitespace)
            .filter(|idx| *idx > 0)
            .unwrap_or(hard);
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }
    chunks
}

fn contextual_schema() -> JsonSchema {
    JsonSchema::new(
        "contextual_text",
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["contextual_text"],
            "properties": {
                "contextual_text": {"type": "string"}
            }
        }),
    )
}

/// Chunks every final message, situates each chunk against its message and embeds it
pub struct IndexPhase;

impl IndexPhase {
    async fn contextualize(&self, ctx: &PhaseContext, message: &ChatMessage, chunk: &str) -> Option<String> {
        if !ctx.config.contextualize {
            return None;
        }
        let user = format!(
            "Message #{} ({}):\n{}\n\nChunk:\n{}",
            message.seq,
            message.role.as_str(),
            truncate_chars(&message.content, CONTEXT_PREFIX_CHARS),
            chunk
        );
        match ctx.generate_json(CONTEXTUALIZE_SYSTEM_PROMPT, user, contextual_schema()).await {
            Ok(value) => value
                .get("contextual_text")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            Err(e) => {
                debug!(message_id = %message.id, error = %e, "contextualization failed; using raw chunk");
                None
            }
        }
    }

    async fn index_message(&self, ctx: &PhaseContext, message: &ChatMessage) -> Vec<ChatDoc> {
        let thread = &ctx.thread;
        let mut docs = Vec::new();
        for (idx, chunk) in chunk_text(&message.content, ctx.config.chunk_chars).into_iter().enumerate() {
            let contextual = self.contextualize(ctx, message, &chunk).await;
            let mut doc = ChatDoc::projected(
                thread.user_id,
                DocType::MessageChunk,
                Scope::Thread,
                Some(thread.id),
                message.id,
                idx as u32,
                CHAT_DOC_VERSION,
                chunk,
            )
            .in_thread(thread.id)
            .at_seq(message.seq);
            if let Some(path_id) = thread.path_id {
                doc = doc.in_path(path_id);
            }
            if let Some(contextual) = contextual {
                doc = doc.with_contextual_text(contextual);
            }
            docs.push(doc);
        }
        docs
    }
}

#[async_trait]
impl Phase for IndexPhase {
    fn name(&self) -> &'static str {
        "index"
    }

    fn cursor(&self) -> Cursor {
        Cursor::Indexed
    }

    async fn run(&self, ctx: &PhaseContext, cursor: i64) -> Result<PhaseOutcome> {
        let window = ctx.window(cursor).await?;
        let candidates: Vec<&ChatMessage> = window
            .messages
            .iter()
            .filter(|m| m.status != MessageStatus::Error && !m.is_deleted() && !m.content.trim().is_empty())
            .collect();

        let pending: Vec<_> = candidates.into_iter().map(|m| self.index_message(ctx, m)).collect();
        let per_message: Vec<Vec<ChatDoc>> = stream::iter(pending)
            .buffered(ctx.config.index_concurrency.max(1))
            .collect()
            .await;
        let mut docs: Vec<ChatDoc> = per_message.into_iter().flatten().collect();

        let missing = ctx.embed_docs(&mut docs).await;
        if missing > 0 {
            warn!(thread_id = %ctx.thread.id, missing, "message chunks written without embeddings");
        }
        let written = ctx.project(docs).await?;

        Ok(PhaseOutcome {
            up_to: window.up_to,
            written,
            skipped: missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        assert_eq!(chunk_text("  hello there  ", 100), vec!["hello there".to_string()]);
        assert!(chunk_text("   ", 100).is_empty());
    }

    #[test]
    fn test_chunks_break_on_whitespace() {
        let chunks = chunk_text("alpha beta gamma delta", 11);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn test_chunks_respect_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }
}
