//! Vector index seam and an in-process cosine implementation.

use std::{collections::HashMap, sync::RwLock};

use {
    async_trait::async_trait,
    mnemo_common::Metadata,
    serde::Serialize,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub key: String,
    pub score: f32,
    pub metadata: Metadata,
}

/// Writes are synchronous: once `index` returns the entry is searchable.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the entry stored under `key`.
    async fn index(&self, key: &str, embedding: Vec<f32>, metadata: Metadata) -> anyhow::Result<()>;

    /// Top `k` entries by descending score. Every `filters` pair must equal
    /// the entry's metadata value.
    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filters: &Metadata,
    ) -> anyhow::Result<Vec<VectorHit>>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    async fn count(&self) -> anyhow::Result<usize>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

pub fn metadata_matches(metadata: &Metadata, filters: &Metadata) -> bool {
    filters.iter().all(|(k, v)| metadata.get(k) == Some(v))
}

#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<String, (Vec<f32>, Metadata)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> anyhow::Error {
        anyhow::anyhow!("vector index lock poisoned")
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn index(&self, key: &str, embedding: Vec<f32>, metadata: Metadata) -> anyhow::Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(key.to_string(), (embedding, metadata));
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filters: &Metadata,
    ) -> anyhow::Result<Vec<VectorHit>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, (_, meta))| metadata_matches(meta, filters))
            .map(|(key, (embedding, meta))| VectorHit {
                key: key.clone(),
                score: cosine_similarity(query, embedding),
                metadata: meta.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        Ok(entries.remove(key).is_some())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.entries.read().map_err(|_| Self::poisoned())?.len())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, serde_json::json};

    fn meta(domain: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("domain".into(), json!(domain));
        m
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn search_ranks_and_filters() {
        let index = InMemoryVectorIndex::new();
        index.index("a", vec![1.0, 0.0], meta("backend")).await.unwrap();
        index.index("b", vec![0.7, 0.7], meta("backend")).await.unwrap();
        index.index("c", vec![1.0, 0.1], meta("frontend")).await.unwrap();

        let hits = index.similarity_search(&[1.0, 0.0], 10, &Metadata::new()).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.key.as_str()).collect::<Vec<_>>(), vec!["a", "c", "b"]);

        let hits = index.similarity_search(&[1.0, 0.0], 1, &meta("backend")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "a");
    }

    #[tokio::test]
    async fn index_replaces_and_delete_removes() {
        let index = InMemoryVectorIndex::new();
        index.index("a", vec![1.0], meta("x")).await.unwrap();
        index.index("a", vec![1.0], meta("y")).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        assert!(index.delete("a").await.unwrap());
        assert!(!index.delete("a").await.unwrap());
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
