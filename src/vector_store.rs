//! Vector store collaborator interface.
//!
//! The similarity index and embedding computation live outside this crate;
//! [`VectorStore`] is the contract the retrieval tool consumes. An
//! [`InMemoryVectorStore`] is provided for tests and small corpora; it
//! scores by brute-force token overlap, no embedding model required.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::RwLock;

use crate::models::{ChunkMetadata, RetrievalChunk};

/// Corpus statistics reported by a store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub document_count: usize,
}

/// A similarity index over document chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Return the `top_k` closest chunks for the query, ascending by
    /// distance. `filter` optionally restricts by metadata fields
    /// (`document_id`, `folder`, `tag`).
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&Value>,
    ) -> Result<Vec<RetrievalChunk>>;

    async fn get_stats(&self) -> Result<StoreStats>;
}

struct StoredChunk {
    chunk_id: String,
    content: String,
    metadata: ChunkMetadata,
    tokens: HashSet<String>,
}

/// In-memory store for tests and small corpora.
///
/// Distance is `1 - overlap`, where overlap is the fraction of query tokens
/// present in the chunk. A chunk sharing no tokens with the query is not
/// returned at all.
pub struct InMemoryVectorStore {
    chunks: RwLock<Vec<StoredChunk>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_chunk(
        &self,
        chunk_id: impl Into<String>,
        content: impl Into<String>,
        metadata: ChunkMetadata,
    ) {
        let content = content.into();
        let tokens = tokenize(&content);
        self.chunks.write().unwrap().push(StoredChunk {
            chunk_id: chunk_id.into(),
            content,
            metadata,
            tokens,
        });
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn matches_filter(metadata: &ChunkMetadata, filter: &Value) -> bool {
    if let Some(doc_id) = filter.get("document_id").and_then(|v| v.as_str()) {
        if metadata.document_id != doc_id {
            return false;
        }
    }
    if let Some(folder) = filter.get("folder").and_then(|v| v.as_str()) {
        if metadata.folder.as_deref() != Some(folder) {
            return false;
        }
    }
    if let Some(tag) = filter.get("tag").and_then(|v| v.as_str()) {
        if !metadata.tags.iter().any(|t| t == tag) {
            return false;
        }
    }
    true
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&Value>,
    ) -> Result<Vec<RetrievalChunk>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = self.chunks.read().unwrap();
        let mut scored: Vec<RetrievalChunk> = chunks
            .iter()
            .filter(|c| filter.map_or(true, |f| matches_filter(&c.metadata, f)))
            .filter_map(|c| {
                let hits = query_tokens.iter().filter(|t| c.tokens.contains(*t)).count();
                if hits == 0 {
                    return None;
                }
                let overlap = hits as f32 / query_tokens.len() as f32;
                Some(RetrievalChunk {
                    chunk_id: c.chunk_id.clone(),
                    content: c.content.clone(),
                    metadata: c.metadata.clone(),
                    distance: 1.0 - overlap,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        let chunks = self.chunks.read().unwrap();
        let documents: HashSet<&str> = chunks
            .iter()
            .map(|c| c.metadata.document_id.as_str())
            .collect();
        Ok(StoreStats {
            chunk_count: chunks.len(),
            document_count: documents.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(doc: &str) -> ChunkMetadata {
        ChunkMetadata {
            document_id: doc.to_string(),
            filename: Some(format!("{doc}.md")),
            tags: vec!["test".to_string()],
            folder: Some("docs".to_string()),
        }
    }

    #[tokio::test]
    async fn search_ranks_by_overlap() {
        let store = InMemoryVectorStore::new();
        store.add_chunk("c1", "Paris is the capital of France.", meta("d1"));
        store.add_chunk("c2", "Berlin is the capital of Germany.", meta("d2"));
        store.add_chunk("c3", "Rust is a systems programming language.", meta("d3"));

        let results = store
            .search("What is the capital of France?", 5, None)
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "c1");
        assert!(results[0].distance < results[1].distance);
        // c3 shares only "is" with the query, still a nonzero overlap
        assert!(results.len() >= 2);
    }

    #[tokio::test]
    async fn search_respects_top_k_and_filter() {
        let store = InMemoryVectorStore::new();
        store.add_chunk("c1", "alpha beta gamma", meta("d1"));
        store.add_chunk("c2", "alpha beta delta", meta("d2"));

        let results = store.search("alpha beta", 1, None).await.unwrap();
        assert_eq!(results.len(), 1);

        let filter = serde_json::json!({"document_id": "d2"});
        let results = store.search("alpha beta", 5, Some(&filter)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c2");
    }

    #[tokio::test]
    async fn stats_count_distinct_documents() {
        let store = InMemoryVectorStore::new();
        store.add_chunk("c1", "a", meta("d1"));
        store.add_chunk("c2", "b", meta("d1"));
        store.add_chunk("c3", "c", meta("d2"));

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.document_count, 2);
    }
}
