//! Summary forest: fixed leaf windows, clustered parents above them

use async_trait::async_trait;
use chrono::Utc;
use lumen_llm::JsonSchema;
use lumen_persist::PersistError;
use lumen_types::ids::{self, CHAT_DOC_VERSION};
use lumen_types::{ChatDoc, ChatMessage, Cursor, DocType, Scope, SummaryNode};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::kmeans::{cluster, contiguous_groups};
use super::{transcript, truncate_chars, Phase, PhaseContext, PhaseOutcome};
use crate::error::Result;
use crate::prompts::{LEAF_SUMMARY_SYSTEM_PROMPT, PARENT_SUMMARY_SYSTEM_PROMPT};

const MESSAGE_CHARS: usize = 1500;
const FALLBACK_LINE_CHARS: usize = 160;
const MAX_LEVELS: u32 = 8;

fn summary_schema() -> JsonSchema {
    JsonSchema::new(
        "summary",
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["summary_md"],
            "properties": {
                "summary_md": {"type": "string"}
            }
        }),
    )
}

fn leaf_fallback(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| {
            format!(
                "- {} (#{}): {}",
                m.role.as_str(),
                m.seq,
                truncate_chars(m.content.trim(), FALLBACK_LINE_CHARS).replace('\n', " ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parent_fallback(children: &[SummaryNode]) -> String {
    children
        .iter()
        .map(|c| format!("### Messages {}-{}\n{}", c.start_seq, c.end_seq, c.summary_md.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn cluster_seed(thread_id: Uuid, level: u32) -> u64 {
    let bytes = thread_id.as_bytes();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(head) ^ u64::from(level)
}

pub struct SummaryPhase;

impl SummaryPhase {
    async fn summarize(&self, ctx: &PhaseContext, system: &str, input: String) -> Option<String> {
        match ctx.generate_json(system, input, summary_schema()).await {
            Ok(value) => value
                .get("summary_md")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            Err(e) => {
                warn!(phase = "summarize", thread_id = %ctx.thread.id, error = %e, "summary generation failed; using extractive fallback");
                None
            }
        }
    }

    fn summary_doc(&self, ctx: &PhaseContext, node: &SummaryNode) -> ChatDoc {
        let thread = &ctx.thread;
        let text = format!(
            "Conversation summary (messages {}-{}, level {}):\n{}",
            node.start_seq, node.end_seq, node.level, node.summary_md
        );
        let doc = ChatDoc::projected(
            thread.user_id,
            DocType::Summary,
            Scope::Thread,
            Some(thread.id),
            node.id,
            0,
            CHAT_DOC_VERSION,
            text,
        )
        .in_thread(thread.id)
        .at_seq(node.end_seq);
        match thread.path_id {
            Some(path_id) => doc.in_path(path_id),
            None => doc,
        }
    }

    /// Leaves for every complete window in `(cursor, up_to]`; returns new nodes and the highest covered seq
    async fn build_leaves(
        &self,
        ctx: &PhaseContext,
        cursor: i64,
        up_to: i64,
    ) -> Result<(Vec<SummaryNode>, i64, usize)> {
        let width = ctx.config.leaf_window.max(1) as i64;
        let first_window = cursor.max(0) / width;
        let full_end = (up_to / width) * width;
        if full_end <= cursor {
            return Ok((Vec::new(), cursor, 0));
        }

        let messages = ctx
            .stores
            .messages
            .list_range(ctx.thread.id, first_window * width, full_end)
            .await?;

        let mut created = Vec::new();
        let mut fallbacks = 0;
        let mut start = first_window * width + 1;
        while start + width - 1 <= full_end {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let end = start + width - 1;
            let leaf_id = ids::summary_leaf_id(ctx.thread.id, start, end);
            if ctx.stores.summaries.get_node(leaf_id).await?.is_some() {
                debug!(start, end, "leaf already present");
                start = end + 1;
                continue;
            }
            let window: Vec<ChatMessage> = messages
                .iter()
                .filter(|m| m.seq >= start && m.seq <= end && !m.is_deleted())
                .cloned()
                .collect();
            let input = format!(
                "Messages {}-{}:\n{}",
                start,
                end,
                transcript(&window, MESSAGE_CHARS)
            );
            let summary_md = match self.summarize(ctx, LEAF_SUMMARY_SYSTEM_PROMPT, input).await {
                Some(summary) => summary,
                None => {
                    fallbacks += 1;
                    leaf_fallback(&window)
                }
            };
            let now = Utc::now();
            let node = ctx
                .stores
                .summaries
                .insert_node(SummaryNode {
                    id: leaf_id,
                    thread_id: ctx.thread.id,
                    parent_id: None,
                    level: 0,
                    start_seq: start,
                    end_seq: end,
                    summary_md,
                    child_node_ids: Vec::new(),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
            created.push(node);
            start = end + 1;
        }
        Ok((created, start - 1, fallbacks))
    }

    /// Group orphans level by level until each level has at most one
    async fn build_parents(&self, ctx: &PhaseContext) -> Result<(Vec<SummaryNode>, usize)> {
        let mut created = Vec::new();
        let mut fallbacks = 0;
        for level in 0..MAX_LEVELS {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let orphans = ctx.stores.summaries.list_orphans(ctx.thread.id, level).await?;
            if orphans.len() <= 1 {
                continue;
            }

            let groups = self.group(ctx, &orphans, level).await;
            for group in groups {
                let children: Vec<SummaryNode> = group.iter().map(|i| orphans[*i].clone()).collect();
                let child_ids: Vec<Uuid> = children.iter().map(|c| c.id).collect();
                let parent_id = ids::summary_parent_id(ctx.thread.id, level + 1, &child_ids);

                let summary_md = match ctx.stores.summaries.get_node(parent_id).await? {
                    Some(existing) => existing.summary_md,
                    None => {
                        let input = children
                            .iter()
                            .map(|c| format!("[{}-{}]\n{}", c.start_seq, c.end_seq, c.summary_md))
                            .collect::<Vec<_>>()
                            .join("\n\n");
                        match self.summarize(ctx, PARENT_SUMMARY_SYSTEM_PROMPT, input).await {
                            Some(summary) => summary,
                            None => {
                                fallbacks += 1;
                                parent_fallback(&children)
                            }
                        }
                    }
                };

                let now = Utc::now();
                let parent = SummaryNode {
                    id: parent_id,
                    thread_id: ctx.thread.id,
                    parent_id: None,
                    level: level + 1,
                    start_seq: children.iter().map(|c| c.start_seq).min().unwrap_or_default(),
                    end_seq: children.iter().map(|c| c.end_seq).max().unwrap_or_default(),
                    summary_md,
                    child_node_ids: child_ids,
                    created_at: now,
                    updated_at: now,
                };
                match ctx.stores.summaries.create_parent(parent).await {
                    Ok(node) => created.push(node),
                    Err(PersistError::Conflict(reason)) => {
                        warn!(phase = "summarize", level, %reason, "summary parent conflict; leaving level for the next pass");
                        return Ok((created, fallbacks));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok((created, fallbacks))
    }

    async fn group(&self, ctx: &PhaseContext, orphans: &[SummaryNode], level: u32) -> Vec<Vec<usize>> {
        let fan_in = ctx.config.cluster_fan_in.max(2);
        let k = orphans.len().div_ceil(fan_in);
        if k <= 1 {
            return vec![(0..orphans.len()).collect()];
        }
        let inputs: Vec<String> = orphans.iter().map(|o| o.summary_md.clone()).collect();
        let points = match ctx.llm.embed(&inputs).await {
            Ok(points) if points.len() == orphans.len() && points.iter().all(|p| !p.is_empty()) => points,
            Ok(_) | Err(_) => {
                warn!(phase = "summarize", level, "orphan embeddings unavailable; grouping by position");
                return (0..orphans.len())
                    .collect::<Vec<_>>()
                    .chunks(fan_in)
                    .map(<[usize]>::to_vec)
                    .fold(Vec::new(), |mut acc: Vec<Vec<usize>>, chunk| {
                        match acc.last_mut() {
                            Some(last) if chunk.len() == 1 => last.extend(chunk),
                            _ => acc.push(chunk),
                        }
                        acc
                    });
            }
        };
        let labels = cluster(&points, k, ctx.config.kmeans_iters, cluster_seed(ctx.thread.id, level));
        contiguous_groups(&points, &labels)
    }
}

#[async_trait]
impl Phase for SummaryPhase {
    fn name(&self) -> &'static str {
        "summarize"
    }

    fn cursor(&self) -> Cursor {
        Cursor::Summarized
    }

    async fn run(&self, ctx: &PhaseContext, cursor: i64) -> Result<PhaseOutcome> {
        let window = ctx.window(cursor).await?;
        let (leaves, covered, leaf_fallbacks) = self.build_leaves(ctx, cursor, window.up_to).await?;
        let (parents, parent_fallbacks) = self.build_parents(ctx).await?;

        let mut docs: Vec<ChatDoc> = leaves
            .iter()
            .chain(parents.iter())
            .map(|n| self.summary_doc(ctx, n))
            .collect();
        ctx.embed_docs(&mut docs).await;
        let written = ctx.project(docs).await?;

        Ok(PhaseOutcome {
            up_to: covered,
            written,
            skipped: leaf_fallbacks + parent_fallbacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_depends_on_level() {
        let thread = Uuid::new_v4();
        assert_eq!(cluster_seed(thread, 0), cluster_seed(thread, 0));
        assert_ne!(cluster_seed(thread, 0), cluster_seed(thread, 1));
    }

    #[test]
    fn test_parent_fallback_lists_children() {
        let now = Utc::now();
        let child = |start, end, text: &str| SummaryNode {
            id: Uuid::new_v4(),
            thread_id: Uuid::nil(),
            parent_id: None,
            level: 0,
            start_seq: start,
            end_seq: end,
            summary_md: text.to_string(),
            child_node_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let text = parent_fallback(&[child(1, 20, "ownership"), child(21, 40, "borrowing")]);
        assert!(text.contains("Messages 1-20"));
        assert!(text.contains("borrowing"));
    }
}
