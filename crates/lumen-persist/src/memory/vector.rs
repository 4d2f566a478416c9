use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::repositories::{cosine_similarity, VectorFilter, VectorMatch, VectorRecord, VectorStore};

/// Brute-force cosine index keyed by namespace
#[derive(Default)]
pub struct InMemoryVectorStore {
    namespaces: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.len())
            .unwrap_or(0)
    }

    pub async fn ids(&self, namespace: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut guard = self.namespaces.write().await;
        let ns = guard.entry(namespace.to_string()).or_default();
        for record in records {
            ns.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query_matches(
        &self,
        namespace: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorMatch>> {
        let guard = self.namespaces.read().await;
        let Some(ns) = guard.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorMatch> = ns
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine_similarity(embedding, &r.embedding),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<()> {
        if let Some(ns) = self.namespaces.write().await.get_mut(namespace) {
            for id in ids {
                ns.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn record(id: &str, embedding: Vec<f32>, scope: &str) -> VectorRecord {
        let mut metadata = Map::new();
        metadata.insert("scope".into(), json!(scope));
        VectorRecord {
            id: id.into(),
            embedding,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine_and_filters() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "ns",
                vec![
                    record("a", vec![1.0, 0.0], "thread"),
                    record("b", vec![0.7, 0.7], "thread"),
                    record("c", vec![1.0, 0.0], "path"),
                ],
            )
            .await
            .unwrap();

        let filter = VectorFilter::new().eq("scope", "thread");
        let hits = store.query_matches("ns", &[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }

    #[tokio::test]
    async fn test_delete_and_unknown_namespace() {
        let store = InMemoryVectorStore::new();
        store.upsert("ns", vec![record("a", vec![1.0], "thread")]).await.unwrap();
        store.delete_ids("ns", &["a".to_string()]).await.unwrap();
        assert_eq!(store.len("ns").await, 0);

        let hits = store
            .query_matches("missing", &[1.0], 5, &VectorFilter::new())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
