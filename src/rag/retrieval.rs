use std::sync::Arc;

use super::vector_index::{SearchHit, VectorIndex};
use super::vector_store::VectorStore;
use crate::error::RagError;
use crate::models::SourceInfo;

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    /// 1-based page number.
    pub page: usize,
    pub preview: String,
    pub distance: f32,
}

impl From<SearchHit> for RetrievedChunk {
    fn from(hit: SearchHit) -> Self {
        Self {
            preview: preview(&hit.chunk.text),
            page: hit.chunk.page + 1,
            text: hit.chunk.text,
            distance: hit.distance,
        }
    }
}

impl RetrievedChunk {
    pub fn source_info(&self) -> SourceInfo {
        SourceInfo {
            page: self.page,
            preview: self.preview.clone(),
        }
    }
}

pub struct RetrievalEngine {
    store: Arc<VectorStore>,
}

impl RetrievalEngine {
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self { store }
    }

    /// Bind the active (or persisted) index.
    pub async fn load(&self) -> Result<Arc<VectorIndex>, RagError> {
        self.store.load().await
    }

    /// Up to `k` chunks, nearest first.
    pub async fn search(&self, question: &str, k: usize) -> Result<Vec<RetrievedChunk>, RagError> {
        let hits = self.store.similarity_search(question, k).await?;
        Ok(hits.into_iter().map(RetrievedChunk::from).collect())
    }
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{}...", head.replace('\n', " "))
}

/// Chunk texts in ranked order, best match first.
pub fn assemble_context(results: &[RetrievedChunk]) -> String {
    results
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::chunker::Chunk;
    use crate::rag::test_support::HashEmbedder;
    use crate::rag::vector_index::IndexOptions;

    fn chunk(text: &str, page: usize, chunk_index: usize) -> Chunk {
        Chunk {
            text: text.to_string(),
            page,
            chunk_index,
            start: 0,
            end: text.len(),
        }
    }

    #[test]
    fn preview_truncates_and_flattens_newlines() {
        let text = format!("line one\nline two {}", "x".repeat(100));
        let p = preview(&text);
        assert!(p.starts_with("line one line two"));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
    }

    #[tokio::test]
    async fn search_without_an_index_is_index_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::new(
            dir.path().join("index"),
            Arc::new(HashEmbedder::default()),
            IndexOptions::default(),
        ));
        let engine = RetrievalEngine::new(store);
        assert!(matches!(engine.search("anything", 3).await, Err(RagError::IndexNotFound)));
    }

    #[tokio::test]
    async fn results_are_nearest_first_with_one_based_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::new(
            dir.path().join("index"),
            Arc::new(HashEmbedder::default()),
            IndexOptions::default(),
        ));
        let chunks = vec![
            chunk("zzzz zzzz", 0, 0),
            chunk("apples and oranges", 1, 1),
            chunk("apples", 4, 2),
        ];
        let mut builder = store.builder(chunks.len());
        builder
            .add_documents(&chunks, &crate::rag::retry::RetryPolicy::new(1, std::time::Duration::ZERO))
            .await
            .unwrap();
        store.publish(builder.finish().await.unwrap()).await;

        let engine = RetrievalEngine::new(store);
        let results = engine.search("apples", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].page, 5);
        assert_eq!(results[0].distance, 0.0);
        assert!(results[0].distance <= results[1].distance);
        assert_eq!(assemble_context(&results).split("\n\n").next(), Some("apples"));
    }
}
