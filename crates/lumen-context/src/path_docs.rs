//! Projection documents for a learning path
//!
//! Shared by the path indexer (which persists and embeds them) and the planner
//! (which synthesizes them on the fly when the projection is missing or stale).

use std::collections::HashMap;

use lazy_static::lazy_static;
use lumen_persist::PathRepository;
use lumen_types::ids::CHAT_PATH_DOC_VERSION;
use lumen_types::{
    ChatDoc, Concept, ConceptEdge, DocType, LearningPath, MaterialFile, NodeDoc, PathNode, Scope,
};
use regex::Regex;
use uuid::Uuid;

use crate::error::Result;

lazy_static! {
    static ref BLOCK_MARKER: Regex = Regex::new(r"^\[block:([^\]\s]+)\]\s*\n?").unwrap();
}

const UNIT_DOC_CHARS: usize = 6_000;

/// Canonical rows behind one path's projection
#[derive(Debug, Clone)]
pub struct PathSnapshot {
    pub path: LearningPath,
    pub nodes: Vec<PathNode>,
    pub node_docs: Vec<NodeDoc>,
    pub concepts: Vec<Concept>,
    pub edges: Vec<ConceptEdge>,
    pub files: Vec<MaterialFile>,
}

impl PathSnapshot {
    pub async fn load(paths: &dyn PathRepository, path_id: Uuid) -> Result<Option<Self>> {
        let Some(path) = paths.get_path(path_id).await? else {
            return Ok(None);
        };
        let nodes = paths.list_nodes(path_id).await?;
        let node_docs = paths.list_node_docs(path_id).await?;
        let concepts = paths.list_concepts(path_id).await?;
        let edges = paths.list_concept_edges(path_id).await?;
        let files = match path.material_set_id {
            Some(set_id) => paths.list_material_files(set_id).await?,
            None => Vec::new(),
        };
        Ok(Some(Self {
            path,
            nodes,
            node_docs,
            concepts,
            edges,
            files,
        }))
    }

    fn units(&self) -> Vec<&PathNode> {
        let mut units: Vec<&PathNode> = self.nodes.iter().filter(|n| n.parent_id.is_none()).collect();
        units.sort_by_key(|n| n.index);
        units
    }

    fn children(&self, parent: Uuid) -> Vec<&PathNode> {
        let mut children: Vec<&PathNode> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id == Some(parent))
            .collect();
        children.sort_by_key(|n| n.index);
        children
    }
}

fn path_doc(
    user_id: Uuid,
    path_id: Uuid,
    doc_type: DocType,
    source_id: Uuid,
    chunk_index: u32,
    text: String,
) -> ChatDoc {
    ChatDoc::projected(
        user_id,
        doc_type,
        Scope::Path,
        Some(path_id),
        source_id,
        chunk_index,
        CHAT_PATH_DOC_VERSION,
        text,
    )
    .in_path(path_id)
}

/// Outline: title, description, numbered units and their lessons
pub fn overview_text(snapshot: &PathSnapshot) -> String {
    let mut out = format!("Learning path: {}\n", snapshot.path.title.trim());
    if !snapshot.path.description.trim().is_empty() {
        out.push_str(snapshot.path.description.trim());
        out.push('\n');
    }
    out.push_str("\nUnits:\n");
    for (i, unit) in snapshot.units().into_iter().enumerate() {
        out.push_str(&format!("{}. {}", i + 1, unit.title.trim()));
        if !unit.goal.trim().is_empty() {
            out.push_str(&format!(" (goal: {})", unit.goal.trim()));
        }
        out.push('\n');
        for (j, lesson) in snapshot.children(unit.id).into_iter().enumerate() {
            out.push_str(&format!("   {}.{} {}\n", i + 1, j + 1, lesson.title.trim()));
        }
    }
    out
}

pub fn overview_doc(user_id: Uuid, snapshot: &PathSnapshot) -> ChatDoc {
    let id = snapshot.path.id;
    path_doc(user_id, id, DocType::PathOverview, id, 0, overview_text(snapshot))
}

pub fn node_docs(user_id: Uuid, snapshot: &PathSnapshot) -> Vec<ChatDoc> {
    let titles: HashMap<Uuid, &str> = snapshot
        .nodes
        .iter()
        .map(|n| (n.id, n.title.as_str()))
        .collect();
    snapshot
        .nodes
        .iter()
        .map(|node| {
            let mut text = match node.parent_id.and_then(|p| titles.get(&p)) {
                Some(parent) => format!("Lesson \"{}\" in unit \"{}\"", node.title.trim(), parent.trim()),
                None => format!("Unit {}: {}", node.index + 1, node.title.trim()),
            };
            if !node.goal.trim().is_empty() {
                text.push_str(&format!("\nGoal: {}", node.goal.trim()));
            }
            path_doc(user_id, snapshot.path.id, DocType::PathNode, node.id, 0, text)
        })
        .collect()
}

pub fn concepts_text(snapshot: &PathSnapshot) -> String {
    let names: HashMap<Uuid, &str> = snapshot
        .concepts
        .iter()
        .map(|c| (c.id, c.name.as_str()))
        .collect();
    let mut concepts: Vec<&Concept> = snapshot.concepts.iter().collect();
    concepts.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.name.cmp(&b.name)));

    let mut out = format!("Concepts in {}:\n", snapshot.path.title.trim());
    for concept in concepts {
        out.push_str(&format!("- {}", concept.name.trim()));
        if !concept.summary.trim().is_empty() {
            out.push_str(&format!(": {}", concept.summary.trim()));
        }
        out.push('\n');
    }
    let relations: Vec<String> = snapshot
        .edges
        .iter()
        .filter_map(|e| {
            let from = names.get(&e.from_concept_id)?;
            let to = names.get(&e.to_concept_id)?;
            Some(format!("- {} {} {}", from, e.edge_type.replace('_', " "), to))
        })
        .collect();
    if !relations.is_empty() {
        out.push_str("\nRelations:\n");
        out.push_str(&relations.join("\n"));
        out.push('\n');
    }
    out
}

pub fn concepts_doc(user_id: Uuid, snapshot: &PathSnapshot) -> ChatDoc {
    let id = snapshot.path.id;
    path_doc(user_id, id, DocType::PathConcepts, id, 0, concepts_text(snapshot))
}

pub fn materials_doc(user_id: Uuid, snapshot: &PathSnapshot) -> Option<ChatDoc> {
    if snapshot.files.is_empty() {
        return None;
    }
    let mut text = String::from("Source materials for this path:\n");
    for file in &snapshot.files {
        text.push_str(&format!("- {}", file.original_name));
        if let Some(summary) = file.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            text.push_str(&format!(": {}", summary.trim()));
        }
        text.push('\n');
    }
    let id = snapshot.path.id;
    Some(path_doc(user_id, id, DocType::PathMaterials, id, 0, text))
}

/// Prefix that lets a retrieved block row be traced back to its block id
pub fn block_marker(block_id: &str) -> String {
    format!("[block:{}]\n", block_id)
}

/// Split a block row's text into `(block_id, body)`
pub fn parse_block_marker(text: &str) -> Option<(&str, &str)> {
    let caps = BLOCK_MARKER.captures(text)?;
    let whole = caps.get(0)?;
    let id = caps.get(1)?.as_str();
    Some((id, &text[whole.end()..]))
}

/// One `path_unit_doc` per node doc plus one `path_unit_block` per block
pub fn unit_docs(user_id: Uuid, snapshot: &PathSnapshot) -> Vec<ChatDoc> {
    let mut out = Vec::new();
    for doc in &snapshot.node_docs {
        let mut body = format!("{}\n", doc.title.trim());
        for block in &doc.blocks {
            body.push('\n');
            body.push_str(&block.render());
            body.push('\n');
        }
        let body: String = body.chars().take(UNIT_DOC_CHARS).collect();
        out.push(path_doc(user_id, doc.path_id, DocType::PathUnitDoc, doc.node_id, 0, body));

        for (i, block) in doc.blocks.iter().enumerate() {
            let text = format!("{}{}", block_marker(&block.id), block.render());
            let contextual = format!("{}: {}", doc.title.trim(), block.render());
            out.push(
                path_doc(user_id, doc.path_id, DocType::PathUnitBlock, doc.node_id, i as u32, text)
                    .with_contextual_text(contextual),
            );
        }
    }
    out
}

/// Every projection row for the path, in a stable order
pub fn build_path_docs(user_id: Uuid, snapshot: &PathSnapshot) -> Vec<ChatDoc> {
    let mut docs = vec![overview_doc(user_id, snapshot)];
    docs.extend(node_docs(user_id, snapshot));
    if !snapshot.concepts.is_empty() {
        docs.push(concepts_doc(user_id, snapshot));
    }
    docs.extend(materials_doc(user_id, snapshot));
    docs.extend(unit_docs(user_id, snapshot));
    docs
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::Utc;
    use lumen_types::DocBlock;

    pub fn snapshot(user_id: Uuid) -> PathSnapshot {
        let path_id = Uuid::new_v4();
        let now = Utc::now();
        let unit = |index: u32, title: &str| PathNode {
            id: Uuid::new_v4(),
            path_id,
            parent_id: None,
            index,
            title: title.into(),
            goal: String::new(),
            kind: "unit".into(),
            updated_at: now,
        };
        let u1 = unit(0, "Signals and Systems");
        let u2 = unit(1, "The Fourier Transform");
        let lesson = PathNode {
            id: Uuid::new_v4(),
            path_id,
            parent_id: Some(u2.id),
            index: 0,
            title: "Frequency intuition".into(),
            goal: "See signals as sums of sinusoids".into(),
            kind: "lesson".into(),
            updated_at: now,
        };
        let node_doc = NodeDoc {
            id: Uuid::new_v4(),
            user_id,
            path_id,
            node_id: lesson.id,
            title: "Frequency intuition".into(),
            blocks: vec![
                DocBlock {
                    id: "b1".into(),
                    block_type: "paragraph".into(),
                    title: Some("Why frequency".into()),
                    body: "Every periodic signal is a sum of sinusoids.".into(),
                },
                DocBlock {
                    id: "b2".into(),
                    block_type: "example".into(),
                    title: None,
                    body: "A square wave keeps only odd harmonics.".into(),
                },
            ],
            updated_at: now,
        };
        PathSnapshot {
            path: LearningPath {
                id: path_id,
                user_id,
                title: "Intro to Signals".into(),
                description: "A short course".into(),
                material_set_id: None,
                job_id: None,
                status: "ready".into(),
                created_at: now,
                updated_at: now,
            },
            nodes: vec![u1, u2, lesson],
            node_docs: vec![node_doc],
            concepts: vec![],
            edges: vec![],
            files: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overview_lists_units_in_order() {
        let snap = fixtures::snapshot(Uuid::new_v4());
        let text = overview_text(&snap);
        let a = text.find("1. Signals and Systems").unwrap();
        let b = text.find("2. The Fourier Transform").unwrap();
        assert!(a < b);
        assert!(text.contains("2.1 Frequency intuition"));
    }

    #[test]
    fn test_path_doc_ids_are_deterministic() {
        let user = Uuid::new_v4();
        let snap = fixtures::snapshot(user);
        let first: Vec<Uuid> = build_path_docs(user, &snap).iter().map(|d| d.id).collect();
        let second: Vec<Uuid> = build_path_docs(user, &snap).iter().map(|d| d.id).collect();
        assert_eq!(first, second);
        assert!(build_path_docs(user, &snap).iter().all(|d| d.scope == Scope::Path));
    }

    #[test]
    fn test_block_marker_round_trip() {
        let user = Uuid::new_v4();
        let snap = fixtures::snapshot(user);
        let blocks: Vec<ChatDoc> = unit_docs(user, &snap)
            .into_iter()
            .filter(|d| d.doc_type == DocType::PathUnitBlock)
            .collect();
        assert_eq!(blocks.len(), 2);
        let (id, body) = parse_block_marker(&blocks[1].text).unwrap();
        assert_eq!(id, "b2");
        assert_eq!(body, "A square wave keeps only odd harmonics.");
        assert!(parse_block_marker("no marker").is_none());
    }

    #[test]
    fn test_materials_doc_absent_without_files() {
        let snap = fixtures::snapshot(Uuid::new_v4());
        assert!(materials_doc(Uuid::new_v4(), &snap).is_none());
    }
}
