//! Inverted-file (clustered) search structure.
//!
//! Vectors are partitioned into `nlist` k-means clusters; a query only scans
//! the `nprobe` lists whose centroids are closest to it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::vector_index::l2_squared;
use crate::error::TrainingError;

const KMEANS_MAX_ITERATIONS: usize = 20;
const KMEANS_SEED: u64 = 0x5eed_1f;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfLists {
    centroids: Vec<Vec<f32>>,
    /// Vector ids per list, parallel to `centroids`.
    lists: Vec<Vec<usize>>,
}

impl IvfLists {
    /// Train `nlist` centroids over every vector, then assign each vector to a list.
    pub fn train(vectors: &[Vec<f32>], nlist: usize) -> Result<Self, TrainingError> {
        let nlist = nlist.max(1);
        if vectors.len() < nlist {
            return Err(TrainingError::TooFewVectors { needed: nlist, got: vectors.len() });
        }
        let dimension = vectors[0].len();
        if dimension == 0 {
            return Err(TrainingError::ZeroDimension);
        }
        if let Some(bad) = vectors.iter().position(|v| v.iter().any(|x| !x.is_finite())) {
            return Err(TrainingError::NonFiniteVector(bad));
        }

        let centroids = kmeans(vectors, nlist, dimension);
        let mut ivf = Self {
            lists: vec![Vec::new(); centroids.len()],
            centroids,
        };
        for (id, vector) in vectors.iter().enumerate() {
            ivf.assign(id, vector);
        }
        Ok(ivf)
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    pub fn assign(&mut self, id: usize, vector: &[f32]) {
        let list = nearest_centroid(&self.centroids, vector);
        self.lists[list].push(id);
    }

    /// Ids of every vector in the `nprobe` lists nearest to `query`.
    pub fn candidates(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut ranked: Vec<(f32, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(list, centroid)| (l2_squared(query, centroid), list))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        ranked
            .into_iter()
            .take(nprobe.max(1))
            .flat_map(|(_, list)| self.lists[list].iter().copied())
            .collect()
    }

    /// Structural sanity check for a deserialized instance.
    pub fn validate(&self, vector_count: usize, dimension: usize) -> Result<(), String> {
        if self.centroids.len() != self.lists.len() {
            return Err("centroid and list counts differ".to_string());
        }
        if self.centroids.iter().any(|c| c.len() != dimension) {
            return Err("centroid dimension does not match vectors".to_string());
        }
        let assigned: usize = self.lists.iter().map(Vec::len).sum();
        if assigned != vector_count || self.lists.iter().flatten().any(|&id| id >= vector_count) {
            return Err("inverted lists do not cover the stored vectors".to_string());
        }
        Ok(())
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, l2_squared(vector, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Lloyd's k-means. Seeding picks one random vector, then repeatedly the
/// vector farthest from every centroid chosen so far.
fn kmeans(vectors: &[Vec<f32>], k: usize, dimension: usize) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);
    let first = rng.random_range(0..vectors.len());
    let mut centroids = vec![vectors[first].clone()];
    let mut min_dist: Vec<f32> = vectors.iter().map(|v| l2_squared(v, &centroids[0])).collect();

    while centroids.len() < k {
        let farthest = min_dist
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let centroid = vectors[farthest].clone();
        for (d, v) in min_dist.iter_mut().zip(vectors) {
            *d = d.min(l2_squared(v, &centroid));
        }
        centroids.push(centroid);
    }

    let mut assignments = vec![usize::MAX; vectors.len()];

    for iteration in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (i, vector) in vectors.iter().enumerate() {
            let nearest = nearest_centroid(&centroids, vector);
            if assignments[i] != nearest {
                assignments[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            tracing::debug!(iteration, "k-means converged");
            break;
        }

        let mut sums = vec![vec![0.0f32; dimension]; k];
        let mut counts = vec![0usize; k];
        for (vector, &cluster) in vectors.iter().zip(&assignments) {
            counts[cluster] += 1;
            for (sum, x) in sums[cluster].iter_mut().zip(vector) {
                *sum += x;
            }
        }
        // Empty clusters keep their previous centroid.
        for (cluster, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            if count > 0 {
                centroids[cluster] = sum.into_iter().map(|s| s / count as f32).collect();
            }
        }
    }

    centroids
}
