//! Content-addressed cache of built indexes.
//!
//! Entries live at `<root>/<fingerprint>/` and hold the same two artifacts as
//! the active index. An entry is published with a directory rename, so once
//! both artifacts are visible the entry is complete and is never rewritten in
//! place.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::vector_index::VectorIndex;
use crate::error::{CacheError, RagError};

/// Hex characters kept from the SHA-256 digest (64 bits). By the birthday
/// bound a collision becomes likely around 2^32 distinct documents; a
/// collision would serve another document's index, so raise this if the
/// cache ever holds corpora anywhere near that size.
pub const FINGERPRINT_HEX_LEN: usize = 16;

pub fn fingerprint(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}

#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(fingerprint)
    }

    /// Existence probe only; nothing is read.
    pub fn has(&self, fingerprint: &str) -> bool {
        let hit = VectorIndex::artifacts_exist(&self.entry_dir(fingerprint));
        if hit {
            tracing::info!(hash = %fingerprint, result = "hit", "cache_check");
        } else {
            tracing::debug!(hash = %fingerprint, result = "miss", "cache_check");
        }
        hit
    }

    /// Load a cached index. Missing, partial and corrupt entries all come back
    /// as `None` so the caller recomputes.
    pub fn load(&self, fingerprint: &str) -> Option<VectorIndex> {
        match self.try_load(fingerprint) {
            Ok(index) => {
                tracing::info!(hash = %fingerprint, chunks = index.len(), "cache_loaded");
                Some(index)
            }
            Err(CacheError::Incomplete(_)) => None,
            Err(e) => {
                tracing::error!(hash = %fingerprint, error = %e, "cache_load_failed");
                None
            }
        }
    }

    fn try_load(&self, fingerprint: &str) -> Result<VectorIndex, CacheError> {
        let dir = self.entry_dir(fingerprint);
        if !VectorIndex::artifacts_exist(&dir) {
            return Err(CacheError::Incomplete(fingerprint.to_string()));
        }
        VectorIndex::read_from(&dir).map_err(|e| CacheError::Corrupt {
            fingerprint: fingerprint.to_string(),
            reason: e.to_string(),
        })
    }

    /// Publish `index` under `fingerprint`. Storing the same fingerprint again
    /// replaces the entry.
    pub fn store(&self, fingerprint: &str, index: &VectorIndex, chunk_count: usize) -> Result<(), RagError> {
        let dir = self.entry_dir(fingerprint);
        index.persist_atomically(&dir)?;
        tracing::info!(hash = %fingerprint, chunks = chunk_count, path = %dir.display(), "cache_saved");
        Ok(())
    }

    /// Remove staging directories an interrupted `store` left under the root.
    pub fn remove_staging_dirs(&self) -> Result<usize, RagError> {
        VectorIndex::remove_staging_dirs(&self.root, None)
    }

    /// Delete every cached entry. Irreversible.
    pub fn clear(&self) -> Result<(), RagError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
            tracing::info!(path = %self.root.display(), "cache_cleared");
        }
        Ok(())
    }
}
