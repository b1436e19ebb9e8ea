use crate::embed::{dot, l2_normalize, EMBEDDING_DIM};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::{HashMap, HashSet};

/// Random-hyperplane LSH parameters.
///
/// The seed is a required input rather than a hidden `thread_rng` call:
/// grouping results must be reproducible for a fixed seed and input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshConfig {
    pub dimensions: usize,
    pub num_hash_functions: usize,
    pub num_hash_tables: usize,
    pub seed: u64,
}

impl LshConfig {
    pub fn new(seed: u64) -> Self {
        Self {
            dimensions: EMBEDDING_DIM,
            num_hash_functions: 16,
            num_hash_tables: 4,
            seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LshTableStats {
    pub bucket_count: usize,
    pub max_bucket_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LshStats {
    pub num_photos: usize,
    pub tables: Vec<LshTableStats>,
}

#[derive(Debug, thiserror::Error)]
#[error("vector has {got} dimensions, index expects {expected}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub got: usize,
}

/// In-memory approximate nearest-neighbour index over unit vectors.
///
/// L independent banks of K random hyperplanes; a vector's K sign bits per
/// bank select a bucket. The index stores photo ids only, never the
/// vectors, so memory is O(n * L) ids plus the hyperplanes.
pub struct LshIndex {
    config: LshConfig,
    /// `[table][bit][dimension]`, each hyperplane unit-norm.
    hyperplanes: Vec<Vec<Vec<f32>>>,
    tables: Vec<HashMap<u64, Vec<String>>>,
    num_photos: usize,
}

impl LshIndex {
    pub fn new(mut config: LshConfig) -> Self {
        if config.num_hash_functions > 64 {
            // Signatures are packed into a u64.
            tracing::warn!(
                "lsh: clamping num_hash_functions from {} to 64",
                config.num_hash_functions
            );
            config.num_hash_functions = 64;
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let hyperplanes = (0..config.num_hash_tables)
            .map(|_| {
                (0..config.num_hash_functions)
                    .map(|_| sample_hyperplane(&mut rng, config.dimensions))
                    .collect()
            })
            .collect();
        Self {
            tables: vec![HashMap::new(); config.num_hash_tables],
            hyperplanes,
            num_photos: 0,
            config,
        }
    }

    pub fn config(&self) -> &LshConfig {
        &self.config
    }

    pub fn num_photos(&self) -> usize {
        self.num_photos
    }

    /// Add one photo to every table's bucket for its signature.
    pub fn insert(&mut self, photo_id: &str, vector: &[f32]) -> Result<(), DimensionMismatch> {
        self.check_dimensions(vector)?;
        for table in 0..self.config.num_hash_tables {
            let signature = self.signature(table, vector);
            self.tables[table]
                .entry(signature)
                .or_default()
                .push(photo_id.to_string());
        }
        self.num_photos += 1;
        Ok(())
    }

    /// Union of the query vector's buckets across all tables, minus the
    /// query's own id. The caller still has to verify candidates with a
    /// real similarity check.
    pub fn candidates(
        &self,
        vector: &[f32],
        exclude_id: &str,
    ) -> Result<HashSet<String>, DimensionMismatch> {
        self.check_dimensions(vector)?;
        let mut found = HashSet::new();
        for table in 0..self.config.num_hash_tables {
            let signature = self.signature(table, vector);
            if let Some(bucket) = self.tables[table].get(&signature) {
                for id in bucket {
                    if id != exclude_id {
                        found.insert(id.clone());
                    }
                }
            }
        }
        Ok(found)
    }

    pub fn stats(&self) -> LshStats {
        LshStats {
            num_photos: self.num_photos,
            tables: self
                .tables
                .iter()
                .map(|buckets| LshTableStats {
                    bucket_count: buckets.len(),
                    max_bucket_size: buckets.values().map(Vec::len).max().unwrap_or(0),
                })
                .collect(),
        }
    }

    fn signature(&self, table: usize, vector: &[f32]) -> u64 {
        let mut signature = 0u64;
        for (bit, hyperplane) in self.hyperplanes[table].iter().enumerate() {
            if dot(vector, hyperplane) >= 0.0 {
                signature |= 1 << bit;
            }
        }
        signature
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), DimensionMismatch> {
        if vector.len() != self.config.dimensions {
            return Err(DimensionMismatch {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

/// One unit-norm hyperplane sampled component-wise from the standard
/// normal distribution; falls back to uniform [-1, 1] on the (measure
/// zero) chance of a vanishing norm.
fn sample_hyperplane(rng: &mut StdRng, dimensions: usize) -> Vec<f32> {
    let mut plane: Vec<f32> = (0..dimensions).map(|_| rng.sample(StandardNormal)).collect();
    let norm_sq: f32 = plane.iter().map(|x| x * x).sum();
    if norm_sq.sqrt() <= 1e-6 {
        plane = (0..dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect();
    }
    l2_normalize(&mut plane);
    plane
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(seed: u64) -> LshConfig {
        LshConfig {
            dimensions: 8,
            num_hash_functions: 4,
            num_hash_tables: 3,
            seed,
        }
    }

    fn unit(dimensions: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimensions];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_identical_vectors_always_collide() {
        let mut index = LshIndex::new(small_config(42));
        let v = unit(8, 0);
        index.insert("a", &v).unwrap();
        index.insert("b", &v).unwrap();

        let candidates = index.candidates(&v, "a").unwrap();
        assert!(candidates.contains("b"));
        assert!(!candidates.contains("a"), "query's own id is dropped");
    }

    #[test]
    fn test_deterministic_for_fixed_seed() {
        let a = LshIndex::new(small_config(7));
        let b = LshIndex::new(small_config(7));
        let v: Vec<f32> = {
            let mut v = vec![0.3, -0.1, 0.7, 0.2, -0.4, 0.05, 0.9, -0.6];
            l2_normalize(&mut v);
            v
        };
        for table in 0..3 {
            assert_eq!(a.signature(table, &v), b.signature(table, &v));
        }

        let c = LshIndex::new(small_config(8));
        let differs = (0..3).any(|t| a.signature(t, &v) != c.signature(t, &v));
        assert!(differs, "a different seed should move at least one signature");
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let mut index = LshIndex::new(small_config(1));
        assert!(index.insert("a", &[1.0, 0.0]).is_err());
        assert!(index.candidates(&[1.0, 0.0], "a").is_err());
        assert_eq!(index.num_photos(), 0);
    }

    #[test]
    fn test_stats_track_buckets() {
        let mut index = LshIndex::new(small_config(3));
        let v = unit(8, 0);
        index.insert("a", &v).unwrap();
        index.insert("b", &v).unwrap();
        index.insert("c", &unit(8, 1)).unwrap();

        let stats = index.stats();
        assert_eq!(stats.num_photos, 3);
        assert_eq!(stats.tables.len(), 3);
        for table in &stats.tables {
            assert!(table.bucket_count >= 1);
            assert!(table.max_bucket_size >= 2, "a and b share every bucket");
        }
    }

    #[test]
    fn test_default_config_is_768_dim() {
        let config = LshConfig::new(99);
        assert_eq!(config.dimensions, EMBEDDING_DIM);
        assert_eq!(config.num_hash_functions, 16);
        assert_eq!(config.num_hash_tables, 4);
    }

    #[test]
    fn test_hyperplanes_are_unit_norm() {
        let index = LshIndex::new(small_config(5));
        for table in &index.hyperplanes {
            for plane in table {
                let norm_sq: f32 = plane.iter().map(|x| x * x).sum();
                assert!((norm_sq - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_oversized_k_is_clamped() {
        let mut config = small_config(1);
        config.num_hash_functions = 80;
        let index = LshIndex::new(config);
        assert_eq!(index.config().num_hash_functions, 64);
    }
}
