use std::collections::HashSet;

use lumen_types::{NodeDoc, SessionContext};
use serde::Serialize;
use uuid::Uuid;

const STOPWORDS: &[&str] = &[
    "the", "this", "that", "and", "for", "with", "make", "please", "can", "you", "rewrite",
    "edit", "change", "block", "section", "paragraph", "part", "text", "simplify", "shorten",
    "expand", "improve", "update", "fix", "more", "less", "about",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditTargetSource {
    TitleMatch,
    BodyMatch,
    CurrentBlock,
    VisibleBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditTarget {
    pub node_id: Uuid,
    pub block_id: String,
    pub confidence: f32,
    pub source: EditTargetSource,
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn best_overlap<'a>(
    query: &HashSet<String>,
    candidates: impl Iterator<Item = (&'a str, String)>,
) -> Option<(&'a str, usize)> {
    let mut best: Option<(&str, usize)> = None;
    for (id, text) in candidates {
        let overlap = tokens(&text).intersection(query).count();
        if overlap > 0 && best.map(|(_, b)| overlap > b).unwrap_or(true) {
            best = Some((id, overlap));
        }
    }
    best
}

/// Title tokens, then body tokens, then the current block, then the top visible block
pub fn resolve_edit_target(query: &str, doc: &NodeDoc, session: &SessionContext) -> Option<EditTarget> {
    let q = tokens(query);
    let target = |block_id: &str, confidence: f32, source: EditTargetSource| EditTarget {
        node_id: doc.node_id,
        block_id: block_id.to_string(),
        confidence,
        source,
    };

    if !q.is_empty() {
        let titles = doc
            .blocks
            .iter()
            .filter_map(|b| b.title.as_ref().map(|t| (b.id.as_str(), t.clone())));
        if let Some((id, overlap)) = best_overlap(&q, titles) {
            let confidence = (0.75 + 0.1 * overlap as f32).min(0.95);
            return Some(target(id, confidence, EditTargetSource::TitleMatch));
        }

        let bodies = doc.blocks.iter().map(|b| (b.id.as_str(), b.body.clone()));
        if let Some((id, overlap)) = best_overlap(&q, bodies) {
            let ratio = overlap as f32 / q.len() as f32;
            let confidence = (0.5 + 0.3 * ratio).min(0.8);
            return Some(target(id, confidence, EditTargetSource::BodyMatch));
        }
    }

    if let Some(current) = session.current_block_id.as_deref() {
        if doc.block(current).is_some() {
            return Some(target(current, 0.5, EditTargetSource::CurrentBlock));
        }
    }

    session
        .visible_block_ids
        .iter()
        .find(|id| doc.block(id).is_some())
        .map(|id| target(id, 0.3, EditTargetSource::VisibleBlock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lumen_types::DocBlock;

    fn doc() -> NodeDoc {
        NodeDoc {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            path_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            title: "Derivatives".into(),
            blocks: vec![
                DocBlock {
                    id: "intro".into(),
                    block_type: "paragraph".into(),
                    title: Some("Introduction".into()),
                    body: "A derivative measures instantaneous change.".into(),
                },
                DocBlock {
                    id: "chain".into(),
                    block_type: "paragraph".into(),
                    title: Some("Chain rule".into()),
                    body: "Compose functions and multiply rates.".into(),
                },
            ],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_title_match_wins() {
        let t = resolve_edit_target("rewrite the chain rule section", &doc(), &SessionContext::default()).unwrap();
        assert_eq!(t.block_id, "chain");
        assert_eq!(t.source, EditTargetSource::TitleMatch);
    }

    #[test]
    fn test_body_match() {
        let t = resolve_edit_target("simplify the part about instantaneous change", &doc(), &SessionContext::default())
            .unwrap();
        assert_eq!(t.block_id, "intro");
        assert_eq!(t.source, EditTargetSource::BodyMatch);
    }

    #[test]
    fn test_falls_back_to_session_blocks() {
        let session = SessionContext {
            current_block_id: Some("missing".into()),
            visible_block_ids: vec!["chain".into()],
            ..Default::default()
        };
        let t = resolve_edit_target("make it shorter", &doc(), &session).unwrap();
        assert_eq!(t.block_id, "chain");
        assert_eq!(t.source, EditTargetSource::VisibleBlock);
    }
}
