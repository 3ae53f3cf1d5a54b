use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::embeddings::Embedder;
use super::retry::RetryPolicy;
use super::vector_index::{IndexOptions, SearchHit, VectorIndex};
use crate::error::RagError;
use crate::indexer::chunker::Chunk;

/// The session's single active index, persisted at `store_path`.
///
/// The index itself is immutable once published: ingestion builds a fresh one
/// and swaps the pointer, and searches clone the `Arc` before using it, so a
/// query never observes a half-built index.
pub struct VectorStore {
    store_path: PathBuf,
    embedder: Arc<dyn Embedder>,
    options: IndexOptions,
    active: RwLock<Option<Arc<VectorIndex>>>,
}

impl VectorStore {
    pub fn new(store_path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>, options: IndexOptions) -> Self {
        Self {
            store_path: store_path.into(),
            embedder,
            options,
            active: RwLock::new(None),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    /// Start a new index sized for `chunk_count` chunks.
    pub fn builder(&self, chunk_count: usize) -> IndexBuilder {
        IndexBuilder {
            index: VectorIndex::for_chunk_count(chunk_count, &self.options),
            embedder: self.embedder.clone(),
        }
    }

    /// Replace the active index wholesale.
    pub async fn publish(&self, index: VectorIndex) -> Arc<VectorIndex> {
        let index = Arc::new(index);
        *self.active.write().await = Some(index.clone());
        tracing::info!(chunks = index.len(), strategy = ?index.strategy(), "active index replaced");
        index
    }

    pub async fn snapshot(&self) -> Option<Arc<VectorIndex>> {
        self.active.read().await.clone()
    }

    /// The active index, reading the persisted one on first use.
    pub async fn load(&self) -> Result<Arc<VectorIndex>, RagError> {
        if let Some(index) = self.snapshot().await {
            return Ok(index);
        }
        if !self.exists() {
            return Err(RagError::IndexNotFound);
        }

        let path = self.store_path.clone();
        let index = tokio::task::spawn_blocking(move || VectorIndex::read_from(&path)).await??;
        tracing::debug!(path = %self.store_path.display(), "vector_store_loaded");

        let mut active = self.active.write().await;
        // Another request may have published while we were reading.
        if let Some(current) = active.as_ref() {
            return Ok(current.clone());
        }
        let index = Arc::new(index);
        *active = Some(index.clone());
        Ok(index)
    }

    pub async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, RagError> {
        let index = self.load().await?;
        let query_vector = self.embedder.embed_query(query).await?;
        index.search(&query_vector, k)
    }

    /// Persist the active index to `store_path`.
    pub async fn save(&self) -> Result<(), RagError> {
        let Some(index) = self.snapshot().await else {
            return Ok(());
        };
        let path = self.store_path.clone();
        tokio::task::spawn_blocking(move || index.persist_atomically(&path)).await??;
        tracing::info!(path = %self.store_path.display(), "vector_store_saved");
        Ok(())
    }

    pub fn exists(&self) -> bool {
        VectorIndex::artifacts_exist(&self.store_path)
    }

    /// Remove staging directories an interrupted `save` left beside `store_path`.
    pub fn remove_staging_dirs(&self) -> Result<usize, RagError> {
        let (Some(parent), Some(name)) = (self.store_path.parent(), self.store_path.file_name()) else {
            return Ok(0);
        };
        VectorIndex::remove_staging_dirs(parent, Some(&name.to_string_lossy()))
    }

    /// Drop the active index from memory and disk.
    pub async fn clear(&self) -> Result<(), RagError> {
        *self.active.write().await = None;
        if self.store_path.exists() {
            tokio::fs::remove_dir_all(&self.store_path).await?;
            tracing::info!("vector_store_cleared");
        }
        Ok(())
    }
}

/// An index under construction, private to one ingestion run.
pub struct IndexBuilder {
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
}

impl IndexBuilder {
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Embed `chunks` (retrying rate limits per `retry`) and add them.
    pub async fn add_documents(&mut self, chunks: &[Chunk], retry: &RetryPolicy) -> Result<usize, RagError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedder = &self.embedder;
        let vectors = retry
            .run("embed_documents", || embedder.embed_documents(texts.clone()))
            .await?;
        self.index.insert(chunks, vectors)
    }

    /// Train the search structure off the async runtime.
    pub async fn finish(self) -> Result<VectorIndex, RagError> {
        let mut index = self.index;
        let index = tokio::task::spawn_blocking(move || {
            index.finalize();
            index
        })
        .await?;
        Ok(index)
    }
}
