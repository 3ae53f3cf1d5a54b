use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ivf::IvfLists;
use crate::config::Settings;
use crate::error::RagError;
use crate::indexer::chunker::Chunk;

pub const STRUCTURE_FILE: &str = "index.structure.json";
pub const METADATA_FILE: &str = "index.metadata.json";

/// Search structure, chosen once from the expected chunk count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexStrategy {
    /// Exact brute-force scan.
    Flat,
    /// Clustered inverted file; needs training before vectors are listed.
    Ivf { nlist: usize },
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub approximate_threshold: usize,
    pub approximate_enabled: bool,
    pub nprobe: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            approximate_threshold: 1000,
            approximate_enabled: true,
            nprobe: 8,
        }
    }
}

impl IndexOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            approximate_threshold: settings.approximate_threshold,
            approximate_enabled: settings.approximate_enabled,
            nprobe: settings.ivf_nprobe,
        }
    }
}

impl IndexStrategy {
    pub fn select(chunk_count: usize, options: &IndexOptions) -> Self {
        if chunk_count < options.approximate_threshold {
            return Self::Flat;
        }
        if !options.approximate_enabled {
            tracing::warn!(
                chunk_count,
                "approximate index unavailable, falling back to brute-force search"
            );
            return Self::Flat;
        }
        Self::Ivf { nlist: nlist_for(chunk_count) }
    }
}

/// Cluster count for `n` vectors: round(sqrt(n)), at least one.
pub fn nlist_for(n: usize) -> usize {
    ((n as f64).sqrt().round() as usize).max(1)
}

fn staging_prefix(target_name: &str) -> String {
    format!(".{}.tmp-", target_name)
}

pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub text: String,
    /// 0-based source page.
    pub page: usize,
    pub chunk_index: usize,
}

impl From<&Chunk> for StoredChunk {
    fn from(chunk: &Chunk) -> Self {
        Self {
            text: chunk.text.clone(),
            page: chunk.page,
            chunk_index: chunk.chunk_index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: StoredChunk,
    pub distance: f32,
}

#[derive(Serialize, Deserialize)]
struct IndexStructure {
    strategy: IndexStrategy,
    dimension: Option<usize>,
    nprobe: usize,
    vectors: Vec<Vec<f32>>,
    ivf: Option<IvfLists>,
}

#[derive(Serialize, Deserialize)]
struct IndexMetadata {
    chunk_count: usize,
    created_at: DateTime<Utc>,
    chunks: Vec<StoredChunk>,
}

/// Embedded chunks plus the structure used to search them.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    strategy: IndexStrategy,
    dimension: Option<usize>,
    nprobe: usize,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<StoredChunk>,
    ivf: Option<IvfLists>,
}

impl VectorIndex {
    pub fn new(strategy: IndexStrategy, nprobe: usize) -> Self {
        Self {
            strategy,
            dimension: None,
            nprobe: nprobe.max(1),
            vectors: Vec::new(),
            chunks: Vec::new(),
            ivf: None,
        }
    }

    pub fn for_chunk_count(chunk_count: usize, options: &IndexOptions) -> Self {
        Self::new(IndexStrategy::select(chunk_count, options), options.nprobe)
    }

    pub fn strategy(&self) -> IndexStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Append embedded chunks. For an untrained IVF index the vectors are
    /// staged until `finalize` trains the lists.
    pub fn insert(&mut self, chunks: &[Chunk], vectors: Vec<Vec<f32>>) -> Result<usize, RagError> {
        if chunks.len() != vectors.len() {
            return Err(RagError::CorruptIndex(format!(
                "{} chunks but {} embeddings",
                chunks.len(),
                vectors.len()
            )));
        }
        for vector in &vectors {
            self.check_dimension(vector.len())?;
        }

        for (chunk, vector) in chunks.iter().zip(vectors) {
            let id = self.vectors.len();
            if let Some(ivf) = self.ivf.as_mut() {
                ivf.assign(id, &vector);
            }
            self.vectors.push(vector);
            self.chunks.push(StoredChunk::from(chunk));
        }
        Ok(chunks.len())
    }

    /// Train the IVF lists over everything inserted so far. A training
    /// failure degrades the index to brute-force search instead of failing.
    pub fn finalize(&mut self) {
        let IndexStrategy::Ivf { nlist } = self.strategy else {
            return;
        };
        if self.ivf.is_some() {
            return;
        }
        match IvfLists::train(&self.vectors, nlist) {
            Ok(ivf) => {
                tracing::info!(nlist = ivf.nlist(), vectors = self.vectors.len(), "IVF index trained");
                self.ivf = Some(ivf);
            }
            Err(e) => {
                tracing::warn!(error = %e, "IVF training failed, falling back to brute-force search");
                self.strategy = IndexStrategy::Flat;
            }
        }
    }

    /// Nearest chunks by squared L2 distance, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, RagError> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dimension {
            if query.len() != expected {
                return Err(RagError::DimensionMismatch { expected, got: query.len() });
            }
        }

        let candidates: Vec<usize> = match &self.ivf {
            Some(ivf) => ivf.candidates(query, self.nprobe),
            None => (0..self.vectors.len()).collect(),
        };

        let mut scored: Vec<(f32, usize)> = candidates
            .into_iter()
            .map(|id| (l2_squared(query, &self.vectors[id]), id))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, id)| SearchHit {
                chunk: self.chunks[id].clone(),
                distance,
            })
            .collect())
    }

    fn check_dimension(&mut self, got: usize) -> Result<(), RagError> {
        match self.dimension {
            Some(expected) if expected != got => Err(RagError::DimensionMismatch { expected, got }),
            Some(_) => Ok(()),
            None => {
                self.dimension = Some(got);
                Ok(())
            }
        }
    }

    /// Write both artifacts into `dir`, which must already exist.
    pub fn write_to(&self, dir: &Path) -> Result<(), RagError> {
        let structure = IndexStructure {
            strategy: self.strategy,
            dimension: self.dimension,
            nprobe: self.nprobe,
            vectors: self.vectors.clone(),
            ivf: self.ivf.clone(),
        };
        let metadata = IndexMetadata {
            chunk_count: self.chunks.len(),
            created_at: Utc::now(),
            chunks: self.chunks.clone(),
        };
        std::fs::write(dir.join(STRUCTURE_FILE), serde_json::to_vec(&structure)?)?;
        std::fs::write(dir.join(METADATA_FILE), serde_json::to_vec(&metadata)?)?;
        Ok(())
    }

    /// Write into a temporary sibling directory, then rename it over `target`.
    /// Readers see either the previous entry or the complete new one.
    pub fn persist_atomically(&self, target: &Path) -> Result<(), RagError> {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "index".to_string());
        let staging: PathBuf = parent.join(format!("{}{}", staging_prefix(&name), Uuid::new_v4().simple()));
        std::fs::create_dir_all(&staging)?;

        if let Err(e) = self.write_to(&staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        if target.exists() {
            std::fs::remove_dir_all(target)?;
        }
        if let Err(e) = std::fs::rename(&staging, target) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete staging directories under `parent` left behind by an
    /// interrupted `persist_atomically`. With `target_name`, only that
    /// target's are removed. Must not run while a persist is in flight.
    pub fn remove_staging_dirs(parent: &Path, target_name: Option<&str>) -> Result<usize, RagError> {
        if !parent.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let stale = match target_name {
                Some(target) => name.starts_with(&staging_prefix(target)),
                None => name.starts_with('.') && name.contains(".tmp-"),
            };
            if stale && entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(path = %parent.display(), removed, "stale_staging_removed");
        }
        Ok(removed)
    }

    pub fn artifacts_exist(dir: &Path) -> bool {
        dir.join(STRUCTURE_FILE).is_file() && dir.join(METADATA_FILE).is_file()
    }

    pub fn read_from(dir: &Path) -> Result<Self, RagError> {
        let structure: IndexStructure = serde_json::from_slice(&std::fs::read(dir.join(STRUCTURE_FILE))?)?;
        let metadata: IndexMetadata = serde_json::from_slice(&std::fs::read(dir.join(METADATA_FILE))?)?;

        if metadata.chunks.len() != structure.vectors.len() || metadata.chunk_count != metadata.chunks.len() {
            return Err(RagError::CorruptIndex(format!(
                "metadata lists {} chunks, structure holds {} vectors",
                metadata.chunks.len(),
                structure.vectors.len()
            )));
        }
        if let Some(dimension) = structure.dimension {
            if structure.vectors.iter().any(|v| v.len() != dimension) {
                return Err(RagError::CorruptIndex("vector dimensions are inconsistent".to_string()));
            }
            if let Some(ivf) = &structure.ivf {
                ivf.validate(structure.vectors.len(), dimension)
                    .map_err(RagError::CorruptIndex)?;
            }
        }

        Ok(Self {
            strategy: structure.strategy,
            dimension: structure.dimension,
            nprobe: structure.nprobe.max(1),
            vectors: structure.vectors,
            chunks: metadata.chunks,
            ivf: structure.ivf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: usize) -> Chunk {
        Chunk {
            text: format!("chunk {}", i),
            page: i / 10,
            chunk_index: i,
            start: 0,
            end: 0,
        }
    }

    fn unit(i: usize) -> Vec<f32> {
        vec![i as f32, (i % 7) as f32, 1.0]
    }

    #[test]
    fn strategy_threshold_is_exclusive_below_one_thousand() {
        let options = IndexOptions::default();
        assert_eq!(IndexStrategy::select(999, &options), IndexStrategy::Flat);
        assert_eq!(IndexStrategy::select(1000, &options), IndexStrategy::Ivf { nlist: 32 });
    }

    #[test]
    fn disabled_approximate_backend_falls_back_to_flat() {
        let options = IndexOptions {
            approximate_enabled: false,
            ..IndexOptions::default()
        };
        assert_eq!(IndexStrategy::select(5000, &options), IndexStrategy::Flat);
    }

    #[test]
    fn flat_search_is_exact_and_ordered() {
        let mut index = VectorIndex::new(IndexStrategy::Flat, 1);
        let chunks: Vec<Chunk> = (0..50).map(chunk).collect();
        index.insert(&chunks, (0..50).map(unit).collect()).unwrap();

        let hits = index.search(&unit(20), 3).unwrap();
        assert_eq!(hits[0].chunk.chunk_index, 20);
        assert_eq!(hits[0].distance, 0.0);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn ivf_index_trains_on_finalize() {
        let options = IndexOptions::default();
        let mut index = VectorIndex::for_chunk_count(1000, &options);
        let chunks: Vec<Chunk> = (0..1000).map(chunk).collect();
        index.insert(&chunks, (0..1000).map(unit).collect()).unwrap();
        index.finalize();

        assert_eq!(index.strategy(), IndexStrategy::Ivf { nlist: 32 });
        let hits = index.search(&unit(500), 1).unwrap();
        assert_eq!(hits[0].chunk.chunk_index, 500);
    }

    #[test]
    fn failed_training_degrades_to_flat_without_error() {
        let mut index = VectorIndex::for_chunk_count(1000, &IndexOptions::default());
        let chunks: Vec<Chunk> = (0..1000).map(chunk).collect();
        let mut vectors: Vec<Vec<f32>> = (0..1000).map(unit).collect();
        vectors[3][0] = f32::INFINITY;
        index.insert(&chunks, vectors).unwrap();
        index.finalize();

        assert_eq!(index.strategy(), IndexStrategy::Flat);
        assert_eq!(index.search(&unit(10), 1).unwrap()[0].chunk.chunk_index, 10);
    }

    #[test]
    fn dimension_mismatch_is_not_swallowed() {
        let mut index = VectorIndex::new(IndexStrategy::Flat, 1);
        index.insert(&[chunk(0)], vec![vec![1.0, 2.0]]).unwrap();
        let err = index.insert(&[chunk(1)], vec![vec![1.0]]).unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, got: 1 }));
    }

    #[test]
    fn artifacts_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("entry");
        let mut index = VectorIndex::new(IndexStrategy::Flat, 1);
        index.insert(&[chunk(0), chunk(1)], vec![unit(0), unit(1)]).unwrap();
        index.persist_atomically(&target).unwrap();

        assert!(VectorIndex::artifacts_exist(&target));
        let loaded = VectorIndex::read_from(&target).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.search(&unit(1), 1).unwrap()[0].chunk.text, "chunk 1");

        // no staging directories left behind
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn truncated_metadata_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = VectorIndex::new(IndexStrategy::Flat, 1);
        index.insert(&[chunk(0)], vec![unit(0)]).unwrap();
        index.write_to(dir.path()).unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), b"{\"chunk_count\": 1").unwrap();

        assert!(VectorIndex::read_from(dir.path()).is_err());
    }
}
