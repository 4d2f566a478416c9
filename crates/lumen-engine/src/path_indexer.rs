//! Projects a learning path into chat retrieval docs

use std::sync::Arc;

use lumen_context::path_docs::{build_path_docs, PathSnapshot};
use lumen_context::retriever::vector_record;
use lumen_llm::LlmClient;
use lumen_persist::Stores;
use lumen_types::{ids, DocType, Scope};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};

const EMBED_BATCH: usize = 64;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PathIndexReport {
    pub path_id: Uuid,
    pub removed: usize,
    pub written: usize,
    pub embedded: usize,
}

pub struct PathIndexer {
    stores: Stores,
    llm: Arc<dyn LlmClient>,
}

impl PathIndexer {
    pub fn new(stores: Stores, llm: Arc<dyn LlmClient>) -> Self {
        Self { stores, llm }
    }

    /// Replace every path-family doc of `path_id` with a fresh projection
    #[instrument(skip(self), fields(path_id = %path_id))]
    pub async fn index_path(&self, path_id: Uuid) -> Result<PathIndexReport> {
        let snapshot = PathSnapshot::load(self.stores.paths.as_ref(), path_id)
            .await?
            .ok_or_else(|| EngineError::not_found("path", path_id))?;
        let user_id = snapshot.path.user_id;
        let namespace = ids::user_namespace(user_id);

        let removed = self
            .stores
            .docs
            .delete_docs(user_id, Scope::Path, Some(path_id), &DocType::PATH_FAMILY)
            .await?;
        let stale: Vec<String> = removed.iter().map(|d| d.vector_id.clone()).collect();
        if !stale.is_empty() {
            self.stores.vectors.delete_ids(&namespace, &stale).await?;
        }

        let mut docs = build_path_docs(user_id, &snapshot);
        let mut embedded = 0;
        for batch in docs.chunks_mut(EMBED_BATCH) {
            let inputs: Vec<String> = batch.iter().map(|d| d.retrieval_text().to_string()).collect();
            match self.llm.embed(&inputs).await {
                Ok(vectors) => {
                    for (doc, vector) in batch.iter_mut().zip(vectors) {
                        if !vector.is_empty() {
                            doc.embedding = vector;
                            embedded += 1;
                        }
                    }
                }
                Err(e) => warn!(docs = batch.len(), error = %e, "path doc embedding failed; rows stay lexical-only"),
            }
        }

        let records: Vec<_> = docs
            .iter()
            .filter(|d| !d.embedding.is_empty())
            .map(vector_record)
            .collect();
        let written = docs.len();
        self.stores.docs.upsert_docs(docs).await?;
        if !records.is_empty() {
            self.stores.vectors.upsert(&namespace, records).await?;
        }

        info!(removed = removed.len(), written, embedded, "path projection rebuilt");
        Ok(PathIndexReport {
            path_id,
            removed: removed.len(),
            written,
            embedded,
        })
    }
}
