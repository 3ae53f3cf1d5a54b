use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;

use super::cache::ContentCache;
use super::retry::RetryPolicy;
use super::vector_store::VectorStore;
use crate::config::Settings;
use crate::error::RagError;
use crate::indexer::chunker::chunk_pages;
use crate::indexer::extractor::{PageExtractor, PageText};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStatus {
    pub is_indexing: bool,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub total_chunks: usize,
    pub last_fingerprint: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Indexed { chunk_count: usize },
    ServedFromCache,
}

impl IngestOutcome {
    /// `None` when the index came from the cache and nothing was chunked.
    pub fn chunk_count(&self) -> Option<usize> {
        match self {
            Self::Indexed { chunk_count } => Some(*chunk_count),
            Self::ServedFromCache => None,
        }
    }

    pub fn cache_hit(&self) -> bool {
        matches!(self, Self::ServedFromCache)
    }

    pub fn report(&self) -> IngestReport {
        IngestReport {
            chunk_count: self.chunk_count(),
            cache_hit: self.cache_hit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    pub cache_hit: bool,
}

/// Turns an uploaded document into the active index:
/// extract → chunk → embed in batches → publish → persist → cache.
pub struct IngestionPipeline {
    store: Arc<VectorStore>,
    cache: ContentCache,
    extractor: Arc<dyn PageExtractor>,
    chunk_size: usize,
    chunk_overlap: usize,
    batch_size: usize,
    retry: RetryPolicy,
    status: Mutex<IndexStatus>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<VectorStore>,
        cache: ContentCache,
        extractor: Arc<dyn PageExtractor>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            cache,
            extractor,
            chunk_size: settings.chunk_size,
            chunk_overlap: settings.chunk_overlap,
            batch_size: settings.ingestion_batch_size.max(1),
            retry: RetryPolicy::new(
                settings.ingestion_max_retries,
                Duration::from_secs(settings.ingestion_base_delay_secs),
            ),
            status: Mutex::new(IndexStatus::default()),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub async fn status(&self) -> IndexStatus {
        self.status.lock().await.clone()
    }

    pub async fn is_indexing(&self) -> bool {
        self.status.lock().await.is_indexing
    }

    /// Drop what the status remembers about earlier runs, after the active
    /// index was cleared. A run in progress stays flagged.
    pub async fn forget_last_run(&self) {
        let mut status = self.status.lock().await;
        *status = IndexStatus {
            is_indexing: status.is_indexing,
            ..IndexStatus::default()
        };
    }

    /// Index the document at `path`. With a `fingerprint`, a cached index for
    /// the same bytes is reused instead of recomputing.
    pub async fn ingest(&self, path: &Path, fingerprint: Option<&str>) -> Result<IngestOutcome, RagError> {
        {
            let mut status = self.status.lock().await;
            if status.is_indexing {
                return Err(RagError::IngestionInProgress);
            }
            status.is_indexing = true;
            status.last_error = None;
        }

        // is_indexing must be reset even if a stage panics
        let result = std::panic::AssertUnwindSafe(self.run(path, fingerprint))
            .catch_unwind()
            .await;
        // a cache hit carries no chunk count, so read it off the published index
        let active_chunks = match &result {
            Ok(Ok(_)) => self.store.snapshot().await.map_or(0, |index| index.len()),
            _ => 0,
        };

        let mut status = self.status.lock().await;
        status.is_indexing = false;
        match result {
            Ok(Ok(outcome)) => {
                status.last_indexed_at = Some(Utc::now());
                status.last_fingerprint = fingerprint.map(str::to_string);
                status.total_chunks = active_chunks;
                Ok(outcome)
            }
            Ok(Err(e)) => {
                tracing::error!(path = %path.display(), error = %e, "ingestion failed");
                status.last_error = Some(e.to_string());
                Err(e)
            }
            Err(panic) => {
                status.last_error = Some("Indexing panicked".to_string());
                drop(status);
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn run(&self, path: &Path, fingerprint: Option<&str>) -> Result<IngestOutcome, RagError> {
        if let Some(fp) = fingerprint {
            if self.serve_from_cache(fp).await? {
                return Ok(IngestOutcome::ServedFromCache);
            }
        }

        let pages = self.extract(path.to_path_buf()).await?;
        let chunks = chunk_pages(&pages, self.chunk_size, self.chunk_overlap);
        if chunks.is_empty() {
            return Err(RagError::Content("PDF contains no extractable text".to_string()));
        }

        let total_batches = chunks.len().div_ceil(self.batch_size);
        tracing::info!(
            pages = pages.len(),
            chunks = chunks.len(),
            batches = total_batches,
            "ingestion started"
        );

        let mut builder = self.store.builder(chunks.len());
        for (i, batch) in chunks.chunks(self.batch_size).enumerate() {
            builder.add_documents(batch, &self.retry).await?;
            tracing::debug!(batch = i + 1, total_batches, "batch embedded");
        }
        let index = builder.finish().await?;
        let strategy = index.strategy();

        let active = self.store.publish(index).await;
        self.store.save().await?;

        if let Some(fp) = fingerprint {
            let cache = self.cache.clone();
            let fp = fp.to_string();
            let index = active.clone();
            let chunk_count = chunks.len();
            // A failed cache write only costs a recompute next time.
            match tokio::task::spawn_blocking(move || cache.store(&fp, &index, chunk_count)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "cache_store_failed"),
                Err(e) => tracing::warn!(error = %e, "cache_store_failed"),
            }
        }

        tracing::info!(chunks = chunks.len(), strategy = ?strategy, "ingestion complete");
        Ok(IngestOutcome::Indexed {
            chunk_count: chunks.len(),
        })
    }

    /// Publish and persist a cached index. `false` on a miss or an unusable entry.
    async fn serve_from_cache(&self, fingerprint: &str) -> Result<bool, RagError> {
        if !self.cache.has(fingerprint) {
            return Ok(false);
        }
        let cache = self.cache.clone();
        let fp = fingerprint.to_string();
        let Some(index) = tokio::task::spawn_blocking(move || cache.load(&fp)).await? else {
            tracing::warn!(hash = %fingerprint, "cache entry unusable, recomputing");
            return Ok(false);
        };
        self.store.publish(index).await;
        self.store.save().await?;
        Ok(true)
    }

    async fn extract(&self, path: PathBuf) -> Result<Vec<PageText>, RagError> {
        let extractor = self.extractor.clone();
        match tokio::task::spawn_blocking(move || extractor.extract_pages(&path)).await {
            Ok(Ok(pages)) => Ok(pages),
            Ok(Err(e)) => Err(RagError::Content(format!("Could not read PDF: {:#}", e))),
            Err(e) if e.is_panic() => Err(RagError::Content("Could not parse PDF".to_string())),
            Err(e) => Err(RagError::Join(e)),
        }
    }
}
