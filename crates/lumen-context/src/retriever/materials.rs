//! Source-material excerpts for path threads, expanded through the concept graph

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use lumen_persist::{cosine_similarity, PathRepository, VectorFilter, VectorStore};
use lumen_types::ids;
use lumen_types::{EvidenceKind, EvidenceSource, MaterialChunk};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ContextConfig;
use crate::error::Result;
use crate::filters;

lazy_static! {
    static ref ACROSS_FILES: Regex =
        Regex::new(r"(?i)\b(each|every|all)\s+(of\s+the\s+|my\s+|the\s+)?(files?|documents?|materials?|sources?|uploads?|pdfs?)\b").unwrap();
}

/// Expansion hits inherit this fraction of their seed's score
const EXPANSION_DECAY: f32 = 0.5;
/// Seeds whose concept evidence is followed
const EXPANSION_SEEDS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialSearchMode {
    Dense,
    StoredCosine,
    FullText,
    None,
}

#[derive(Debug, Clone)]
pub struct MaterialQuery<'a> {
    pub material_set_id: Uuid,
    pub path_id: Option<Uuid>,
    pub query: &'a str,
    /// Empty when the caller has no query embedding
    pub embedding: &'a [f32],
}

#[derive(Debug, Clone)]
pub struct MaterialHit {
    pub chunk: MaterialChunk,
    pub file_name: String,
    pub score: f32,
    /// Reached through concept evidence rather than direct search
    pub expanded: bool,
}

impl MaterialHit {
    pub fn evidence_id(&self) -> String {
        format!("chunk:{}", self.chunk.id)
    }

    pub fn label(&self) -> String {
        match self.chunk.locator() {
            Some(loc) => format!("{} ({})", self.file_name, loc),
            None => self.file_name.clone(),
        }
    }

    pub fn render(&self) -> String {
        format!("[source:{}] {}\n{}", self.evidence_id(), self.label(), self.chunk.text.trim())
    }

    pub fn evidence(&self) -> EvidenceSource {
        let mut source = EvidenceSource::new(
            self.evidence_id(),
            EvidenceKind::MaterialChunk,
            self.label(),
            self.chunk.text.clone(),
        );
        source.file_name = Some(self.file_name.clone());
        source.page = self.chunk.page;
        source.start_sec = self.chunk.start_sec;
        source
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterialsTrace {
    pub mode: MaterialSearchMode,
    pub seeds: usize,
    pub expanded: usize,
    pub filtered_out: usize,
    pub diversified: bool,
}

#[derive(Debug, Clone)]
pub struct MaterialsResult {
    pub hits: Vec<MaterialHit>,
    pub trace: MaterialsTrace,
}

pub struct MaterialRetriever {
    paths: Arc<dyn PathRepository>,
    vectors: Arc<dyn VectorStore>,
    config: ContextConfig,
}

impl MaterialRetriever {
    pub fn new(
        paths: Arc<dyn PathRepository>,
        vectors: Arc<dyn VectorStore>,
        config: ContextConfig,
    ) -> Self {
        Self {
            paths,
            vectors,
            config,
        }
    }

    pub async fn retrieve(&self, query: MaterialQuery<'_>) -> Result<MaterialsResult> {
        let (mode, seeds) = self.seed(&query).await?;
        let seed_count = seeds.len();

        let mut scored: HashMap<Uuid, (MaterialChunk, f32, bool)> = seeds
            .into_iter()
            .map(|(chunk, score)| (chunk.id, (chunk, score, false)))
            .collect();

        let expanded = match self.expand(&query, &scored).await {
            Ok(extra) => {
                let n = extra.len();
                for (chunk, score) in extra {
                    scored.entry(chunk.id).or_insert((chunk, score, true));
                }
                n
            }
            Err(e) => {
                warn!(error = %e, "concept expansion failed; using direct hits only");
                0
            }
        };

        let before = scored.len();
        scored.retain(|_, (chunk, _, _)| filters::admit(&chunk.text, query.query));
        let filtered_out = before - scored.len();

        let files: HashMap<Uuid, String> = self
            .paths
            .list_material_files(query.material_set_id)
            .await?
            .into_iter()
            .map(|f| (f.id, f.original_name))
            .collect();

        let mut hits: Vec<MaterialHit> = scored
            .into_values()
            .map(|(chunk, score, expanded)| MaterialHit {
                file_name: files
                    .get(&chunk.material_file_id)
                    .cloned()
                    .unwrap_or_else(|| "source file".to_string()),
                chunk,
                score,
                expanded,
            })
            .collect();
        hits.sort_by(compare_hits);

        let diversified = ACROSS_FILES.is_match(query.query);
        let hits = if diversified {
            round_robin_by_file(hits, self.config.materials_max)
        } else {
            cap_per_file(hits, self.config.materials_per_file, self.config.materials_max)
        };

        debug!(
            material_set_id = %query.material_set_id,
            mode = ?mode,
            seeds = seed_count,
            selected = hits.len(),
            "material retrieval finished"
        );

        Ok(MaterialsResult {
            hits,
            trace: MaterialsTrace {
                mode,
                seeds: seed_count,
                expanded,
                filtered_out,
                diversified,
            },
        })
    }

    /// Dense index, else cosine over stored embeddings, else full-text
    async fn seed(&self, query: &MaterialQuery<'_>) -> Result<(MaterialSearchMode, Vec<(MaterialChunk, f32)>)> {
        let limit = self.config.materials_seed;

        if !query.embedding.is_empty() {
            match self.dense(query, limit).await {
                Ok(hits) if !hits.is_empty() => return Ok((MaterialSearchMode::Dense, hits)),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dense material search failed"),
            }

            let chunks = self.paths.list_material_chunks(query.material_set_id).await?;
            let mut hits: Vec<(MaterialChunk, f32)> = chunks
                .into_iter()
                .filter(|c| !c.embedding.is_empty())
                .map(|c| {
                    let score = cosine_similarity(query.embedding, &c.embedding);
                    (c, score)
                })
                .collect();
            if !hits.is_empty() {
                hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                hits.truncate(limit);
                return Ok((MaterialSearchMode::StoredCosine, hits));
            }
        }

        let hits = self
            .paths
            .search_material_chunks(query.material_set_id, query.query, limit)
            .await?;
        let mode = if hits.is_empty() {
            MaterialSearchMode::None
        } else {
            MaterialSearchMode::FullText
        };
        Ok((mode, hits))
    }

    async fn dense(&self, query: &MaterialQuery<'_>, limit: usize) -> Result<Vec<(MaterialChunk, f32)>> {
        let namespace = ids::material_namespace(query.material_set_id);
        let timeout = Duration::from_millis(self.config.vector_timeout_ms);
        let matches = match tokio::time::timeout(
            timeout,
            self.vectors
                .query_matches(&namespace, query.embedding, limit, &VectorFilter::new()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(crate::error::ContextError::Timeout(self.config.vector_timeout_ms)),
        };

        let scores: HashMap<Uuid, f32> = matches
            .into_iter()
            .filter_map(|m| Uuid::parse_str(&m.id).ok().map(|id| (id, m.score)))
            .collect();
        if scores.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = scores.keys().copied().collect();
        let chunks = self.paths.get_material_chunks(&ids).await?;
        Ok(chunks
            .into_iter()
            .filter(|c| c.material_set_id == query.material_set_id)
            .filter_map(|c| scores.get(&c.id).copied().map(|s| (c, s)))
            .collect())
    }

    /// Follow seed → concept evidence → adjacent concepts → their evidence chunks
    async fn expand(
        &self,
        query: &MaterialQuery<'_>,
        seeds: &HashMap<Uuid, (MaterialChunk, f32, bool)>,
    ) -> Result<Vec<(MaterialChunk, f32)>> {
        let mut top: Vec<(Uuid, f32)> = seeds.iter().map(|(id, (_, s, _))| (*id, *s)).collect();
        top.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        top.truncate(EXPANSION_SEEDS);
        if top.is_empty() {
            return Ok(Vec::new());
        }
        let seed_scores: HashMap<Uuid, f32> = top.iter().copied().collect();
        let seed_ids: Vec<Uuid> = top.iter().map(|(id, _)| *id).collect();

        // concept -> best inherited score
        let mut concept_scores: HashMap<Uuid, f32> = HashMap::new();
        for ev in self.paths.evidence_for_chunks(&seed_ids).await? {
            let inherited = seed_scores.get(&ev.material_chunk_id).copied().unwrap_or(0.0) * ev.weight.clamp(0.0, 1.0);
            let slot = concept_scores.entry(ev.concept_id).or_insert(inherited);
            *slot = slot.max(inherited);
        }
        if concept_scores.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(path_id) = query.path_id {
            let direct: Vec<(Uuid, f32)> = concept_scores.iter().map(|(k, v)| (*k, *v)).collect();
            for edge in self.paths.list_concept_edges(path_id).await? {
                for (concept, score) in &direct {
                    let neighbour = if edge.from_concept_id == *concept {
                        edge.to_concept_id
                    } else if edge.to_concept_id == *concept {
                        edge.from_concept_id
                    } else {
                        continue;
                    };
                    let hop = score * EXPANSION_DECAY * edge.strength.clamp(0.0, 1.0);
                    let slot = concept_scores.entry(neighbour).or_insert(hop);
                    *slot = slot.max(hop);
                }
            }
        }

        let concept_ids: Vec<Uuid> = concept_scores.keys().copied().collect();
        let mut chunk_scores: HashMap<Uuid, f32> = HashMap::new();
        for ev in self.paths.evidence_for_concepts(&concept_ids).await? {
            if seeds.contains_key(&ev.material_chunk_id) {
                continue;
            }
            let score = concept_scores.get(&ev.concept_id).copied().unwrap_or(0.0)
                * EXPANSION_DECAY
                * ev.weight.clamp(0.0, 1.0);
            let slot = chunk_scores.entry(ev.material_chunk_id).or_insert(score);
            *slot = slot.max(score);
        }
        if chunk_scores.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = chunk_scores.keys().copied().collect();
        let chunks = self.paths.get_material_chunks(&ids).await?;
        Ok(chunks
            .into_iter()
            .filter(|c| c.material_set_id == query.material_set_id)
            .filter_map(|c| chunk_scores.get(&c.id).copied().map(|s| (c, s)))
            .collect())
    }
}

fn compare_hits(a: &MaterialHit, b: &MaterialHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.chunk.material_file_id.cmp(&b.chunk.material_file_id))
        .then_with(|| a.chunk.index.cmp(&b.chunk.index))
}

fn cap_per_file(hits: Vec<MaterialHit>, per_file: usize, max: usize) -> Vec<MaterialHit> {
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    let mut out = Vec::new();
    for hit in hits {
        if out.len() >= max {
            break;
        }
        let count = counts.entry(hit.chunk.material_file_id).or_insert(0);
        if *count < per_file.max(1) {
            *count += 1;
            out.push(hit);
        }
    }
    out
}

/// One chunk per file per round, files ordered by their best hit
fn round_robin_by_file(hits: Vec<MaterialHit>, max: usize) -> Vec<MaterialHit> {
    let mut order: Vec<Uuid> = Vec::new();
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut by_file: BTreeMap<Uuid, std::collections::VecDeque<MaterialHit>> = BTreeMap::new();
    for hit in hits {
        let file = hit.chunk.material_file_id;
        if seen.insert(file) {
            order.push(file);
        }
        by_file.entry(file).or_default().push_back(hit);
    }

    let mut out = Vec::new();
    loop {
        let mut progressed = false;
        for file in &order {
            if out.len() >= max {
                return out;
            }
            if let Some(hit) = by_file.get_mut(file).and_then(|q| q.pop_front()) {
                out.push(hit);
                progressed = true;
            }
        }
        if !progressed {
            return out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn hit(file: Uuid, index: u32, score: f32) -> MaterialHit {
        MaterialHit {
            chunk: MaterialChunk {
                id: Uuid::new_v4(),
                material_set_id: Uuid::nil(),
                material_file_id: file,
                index,
                text: format!("chunk {}", index),
                embedding: vec![],
                page: Some(index + 1),
                start_sec: None,
                end_sec: None,
                created_at: Utc::now(),
            },
            file_name: "notes.pdf".into(),
            score,
            expanded: false,
        }
    }

    #[test]
    fn test_cap_per_file() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let hits = vec![hit(a, 0, 0.9), hit(a, 1, 0.8), hit(a, 2, 0.7), hit(b, 0, 0.6)];
        let out = cap_per_file(hits, 2, 10);
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().filter(|h| h.chunk.material_file_id == a).count(), 2);
    }

    #[test]
    fn test_round_robin_spreads_files() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let hits = vec![hit(a, 0, 0.9), hit(a, 1, 0.8), hit(b, 0, 0.5), hit(c, 0, 0.4)];
        let out = round_robin_by_file(hits, 3);
        let files: Vec<Uuid> = out.iter().map(|h| h.chunk.material_file_id).collect();
        assert_eq!(files, vec![a, b, c]);
    }

    #[test]
    fn test_across_files_detection() {
        assert!(ACROSS_FILES.is_match("summarize each of the files"));
        assert!(ACROSS_FILES.is_match("what do all documents say"));
        assert!(!ACROSS_FILES.is_match("quote the file where it defines X"));
    }

    #[test]
    fn test_render_includes_locator() {
        let h = hit(Uuid::new_v4(), 2, 0.5);
        let rendered = h.render();
        assert!(rendered.contains("notes.pdf (p. 3)"));
        assert_eq!(h.evidence().page, Some(3));
    }
}
