//! # VectorIndex
//!
//! Nearest-neighbor search over every stored vector.
//!
//! Vectors live in one row-major slab; the row number **is** the record id, so ids run
//! `0..len()` in insertion order and are never reused. Two strategies are available:
//!
//! - [`IndexStrategy::Exact`]: score every row (in parallel with `rayon`).
//! - [`IndexStrategy::Hnsw`]: ask a [HNSW](https://arxiv.org/abs/1603.09320) graph
//!   (`hora` crate) for a candidate set, then score the candidates exactly. Small
//!   indexes (fewer than [`HNSW_MIN_RECORDS`] rows) skip the graph entirely.
//!
//! Either way the returned scores come from the same exact arithmetic and results are
//! ordered by descending score, ties broken by ascending id.
//!
//! ## Metric
//! Under [`SimilarityMetric::Cosine`] rows are L2-normalized on insertion and the query
//! at search time, and the score is their inner product. Under
//! [`SimilarityMetric::Dot`] the raw inner product is used. Zero vectors score `0`.
//!
//! ## Persistence
//! [`VectorIndex::save`] writes the slab, its shape, the metric and (for HNSW) the
//! dumped graph in a checksummed envelope; [`VectorIndex::load`] restores it so that
//! searches return identical ids, order and scores. These are crate-internal: the
//! index is only ever persisted together with its metadata through
//! [`Snapshot`](crate::snapshot::Snapshot).

use std::cmp::Ordering;
use std::fs;
use std::ops::Range;
use std::path::Path;

use hora::core::ann_index::{ANNIndex, SerializableIndex};
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::{IndexStrategy, SimilarityMetric};
use crate::error::{RagError, Result};
use crate::snapshot::{read_envelope, write_envelope};

/// Integer id of a stored vector (its insertion position).
pub type RecordId = usize;

/// Below this many rows the HNSW strategy searches exactly.
pub const HNSW_MIN_RECORDS: usize = 64;

const VECTOR_MAGIC: &[u8; 8] = b"ARAGVEC1";

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    pub id: RecordId,
    pub score: f32,
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Descending score, then ascending id.
fn rank(a: &ScoredId, b: &ScoredId) -> Ordering {
    b.score.total_cmp(&a.score).then(a.id.cmp(&b.id))
}

#[derive(Serialize, Deserialize)]
struct IndexPayload {
    metric: SimilarityMetric,
    strategy: IndexStrategy,
    dimension: usize,
    record_count: usize,
    vectors: Vec<f32>,
    hnsw_graph: Option<Vec<u8>>,
}

pub struct VectorIndex {
    dimension: usize,
    metric: SimilarityMetric,
    strategy: IndexStrategy,
    /// `len() * dimension` floats, row `i` is record `i`.
    vectors: Vec<f32>,
    graph: Option<HNSWIndex<f32, usize>>,
    /// `hora` dump of `graph`, kept so saving does not need `&mut self`.
    graph_bytes: Option<Vec<u8>>,
}

impl VectorIndex {
    /// Create an empty index.
    ///
    /// # Errors
    /// [`RagError::Configuration`] if `dimension` is zero.
    pub fn new(dimension: usize, metric: SimilarityMetric, strategy: IndexStrategy) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::Configuration(
                "index dimension must be greater than 0".into(),
            ));
        }
        Ok(Self {
            dimension,
            metric,
            strategy,
            vectors: Vec::new(),
            graph: None,
            graph_bytes: None,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    pub fn strategy(&self) -> IndexStrategy {
        self.strategy
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.vectors.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// The stored (possibly normalized) vector for `id`.
    pub fn vector(&self, id: RecordId) -> Option<&[f32]> {
        let start = id.checked_mul(self.dimension)?;
        self.vectors.get(start..start + self.dimension)
    }

    /// Populate an empty index, assigning ids `0..vectors.len()` in input order.
    ///
    /// # Errors
    /// - [`RagError::InvalidState`] if the index already holds records.
    /// - See [`VectorIndex::append`].
    pub(crate) fn build(&mut self, vectors: Vec<Vec<f32>>) -> Result<Range<RecordId>> {
        if !self.is_empty() {
            return Err(RagError::InvalidState(format!(
                "build on an index that already holds {} records",
                self.len()
            )));
        }
        self.append(vectors)
    }

    /// Add vectors after the existing ones, returning the ids they received.
    ///
    /// Every vector is validated before anything is stored, so a failed call leaves
    /// the index unchanged.
    ///
    /// # Errors
    /// - [`RagError::DimensionMismatch`] if any vector has the wrong length.
    /// - [`RagError::InvalidArgument`] if any component is NaN or infinite.
    pub(crate) fn append(&mut self, vectors: Vec<Vec<f32>>) -> Result<Range<RecordId>> {
        for (position, vector) in vectors.iter().enumerate() {
            if vector.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    found: vector.len(),
                });
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(RagError::InvalidArgument(format!(
                    "vector {position} has a non-finite component"
                )));
            }
        }

        let first = self.len();
        self.vectors.reserve(vectors.len() * self.dimension);
        for mut vector in vectors {
            if self.metric == SimilarityMetric::Cosine {
                l2_normalize(&mut vector);
            }
            self.vectors.extend_from_slice(&vector);
        }
        let ids = first..self.len();

        if self.strategy == IndexStrategy::Hnsw {
            self.rebuild_graph()?;
        }
        info!("Indexed {} vectors ({} total)", ids.len(), self.len());
        Ok(ids)
    }

    /// Top `min(k, len())` records by descending score, ties by ascending id.
    ///
    /// # Errors
    /// - [`RagError::InvalidArgument`] if `k == 0` or the query is not finite.
    /// - [`RagError::DimensionMismatch`] if the query has the wrong length.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        if k == 0 {
            return Err(RagError::InvalidArgument("k must be at least 1".into()));
        }
        if query.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                found: query.len(),
            });
        }
        if query.iter().any(|x| !x.is_finite()) {
            return Err(RagError::InvalidArgument(
                "query vector has a non-finite component".into(),
            ));
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        if self.metric == SimilarityMetric::Cosine {
            l2_normalize(&mut query);
        }

        let mut hits = match &self.graph {
            Some(graph) => self.score_candidates(graph, &query, k),
            None => self
                .vectors
                .par_chunks(self.dimension)
                .enumerate()
                .map(|(id, row)| ScoredId {
                    id,
                    score: inner_product(row, &query),
                })
                .collect::<Vec<_>>(),
        };

        hits.sort_unstable_by(rank);
        hits.truncate(k);
        Ok(hits)
    }

    fn score_candidates(
        &self,
        graph: &HNSWIndex<f32, usize>,
        query: &[f32],
        k: usize,
    ) -> Vec<ScoredId> {
        let wanted = k.saturating_mul(4).max(64);
        let mut candidates = graph.search(query, wanted);
        candidates.sort_unstable();
        candidates.dedup();
        debug!("HNSW returned {} candidates", candidates.len());

        candidates
            .into_iter()
            .filter_map(|id| {
                self.vector(id).map(|row| ScoredId {
                    id,
                    score: inner_product(row, query),
                })
            })
            .collect()
    }

    fn rebuild_graph(&mut self) -> Result<()> {
        if self.len() < HNSW_MIN_RECORDS {
            self.graph = None;
            self.graph_bytes = None;
            return Ok(());
        }

        let mut graph = HNSWIndex::<f32, usize>::new(self.dimension, &HNSWParams::default());
        for (id, row) in self.vectors.chunks(self.dimension).enumerate() {
            graph
                .add(row, id)
                .map_err(|e| RagError::InvalidArgument(format!("HNSW insert failed: {e}")))?;
        }
        graph
            // hora's similarity metrics yield NaN distances mid-build and panic in its
            // neighbor ordering. Cosine rows are unit length, so Euclidean ranks them
            // the same way; every candidate is rescored exactly afterwards.
            .build(Metric::Euclidean)
            .map_err(|e| RagError::InvalidArgument(format!("HNSW build failed: {e}")))?;

        let scratch = NamedTempFile::new()?;
        let scratch_path = utf8_path(scratch.path())?;
        graph
            .dump(scratch_path)
            .map_err(|e| RagError::InvalidArgument(format!("HNSW dump failed: {e}")))?;
        self.graph_bytes = Some(fs::read(scratch.path())?);
        self.graph = Some(graph);
        Ok(())
    }

    /// Write the index to `path`, returning the digest of the written payload.
    pub(crate) fn save(&self, path: &Path) -> Result<blake3::Hash> {
        let payload = IndexPayload {
            metric: self.metric,
            strategy: self.strategy,
            dimension: self.dimension,
            record_count: self.len(),
            vectors: self.vectors.clone(),
            hnsw_graph: self.graph_bytes.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|e| RagError::InvalidArgument(format!("failed to encode index: {e}")))?;
        debug!("Writing {} vectors to {}", payload.record_count, path.display());
        write_envelope(path, VECTOR_MAGIC, &bytes)
    }

    /// Restore an index written by [`VectorIndex::save`], returning it with the
    /// payload digest.
    ///
    /// # Errors
    /// - [`RagError::SnapshotNotFound`] if `path` does not exist.
    /// - [`RagError::CorruptIndex`] for any unreadable or inconsistent content.
    pub(crate) fn load(path: &Path) -> Result<(Self, blake3::Hash)> {
        let (bytes, digest) = read_envelope(path, VECTOR_MAGIC)?;
        let (payload, _): (IndexPayload, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| RagError::corrupt(path, format!("undecodable vectors: {e}")))?;

        if payload.dimension == 0 {
            return Err(RagError::corrupt(path, "dimension is zero"));
        }
        let expected = payload
            .record_count
            .checked_mul(payload.dimension)
            .ok_or_else(|| RagError::corrupt(path, "record count overflows"))?;
        if payload.vectors.len() != expected {
            return Err(RagError::corrupt(
                path,
                format!(
                    "expected {} floats for {} records, found {}",
                    expected,
                    payload.record_count,
                    payload.vectors.len()
                ),
            ));
        }

        let graph = match &payload.hnsw_graph {
            Some(graph_bytes) => Some(restore_graph(graph_bytes).map_err(|e| {
                RagError::corrupt(path, format!("unreadable HNSW graph: {e}"))
            })?),
            None => None,
        };
        if payload.strategy == IndexStrategy::Hnsw
            && payload.record_count >= HNSW_MIN_RECORDS
            && graph.is_none()
        {
            return Err(RagError::corrupt(path, "HNSW graph missing"));
        }

        Ok((
            Self {
                dimension: payload.dimension,
                metric: payload.metric,
                strategy: payload.strategy,
                vectors: payload.vectors,
                graph,
                graph_bytes: payload.hnsw_graph,
            },
            digest,
        ))
    }
}

fn utf8_path(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        RagError::InvalidArgument(format!("path is not valid UTF-8: {}", path.display()))
    })
}

fn restore_graph(bytes: &[u8]) -> std::result::Result<HNSWIndex<f32, usize>, String> {
    let scratch = NamedTempFile::new().map_err(|e| e.to_string())?;
    fs::write(scratch.path(), bytes).map_err(|e| e.to_string())?;
    let scratch_path = scratch.path().to_str().ok_or("scratch path is not UTF-8")?;
    HNSWIndex::<f32, usize>::load(scratch_path).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index(metric: SimilarityMetric) -> VectorIndex {
        VectorIndex::new(3, metric, IndexStrategy::Exact).unwrap()
    }

    /// Deterministic pseudo-random vectors (xorshift), no extra crates needed.
    fn pseudo_random_vectors(count: usize, dimension: usize) -> Vec<Vec<f32>> {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..count)
            .map(|_| {
                (0..dimension)
                    .map(|_| {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        ((state % 2000) as f32 / 1000.0) - 1.0
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_build_assigns_ids_in_order() {
        let mut idx = index(SimilarityMetric::Dot);
        let ids = idx
            .build(vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]])
            .unwrap();
        assert_eq!(ids, 0..2);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.vector(1), Some(&[0.0, 1.0, 0.0][..]));
        assert_eq!(idx.vector(2), None);

        let more = idx.append(vec![vec![0.0, 0.0, 1.0]]).unwrap();
        assert_eq!(more, 2..3);
    }

    #[test]
    fn test_build_twice_is_rejected() {
        let mut idx = index(SimilarityMetric::Dot);
        idx.build(vec![vec![1.0, 0.0, 0.0]]).unwrap();
        assert!(matches!(
            idx.build(vec![vec![1.0, 0.0, 0.0]]),
            Err(RagError::InvalidState(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_unchanged() {
        let mut idx = index(SimilarityMetric::Cosine);
        let result = idx.build(vec![vec![1.0, 0.0, 0.0], vec![1.0, 2.0]]);
        assert!(matches!(
            result,
            Err(RagError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert!(idx.is_empty());
    }

    #[test]
    fn test_non_finite_vectors_rejected() {
        let mut idx = index(SimilarityMetric::Dot);
        assert!(matches!(
            idx.build(vec![vec![f32::NAN, 0.0, 0.0]]),
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_search_orders_by_score_then_id() {
        let mut idx = index(SimilarityMetric::Dot);
        idx.build(vec![
            vec![1.0, 0.0, 0.0],
            vec![2.0, 0.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
        ])
        .unwrap();

        let hits = idx.search(&[1.0, 0.0, 0.0], 10).unwrap();
        let ids: Vec<RecordId> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 0, 2, 3]);
        assert_eq!(hits[0].score, 2.0);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        let mut idx = index(SimilarityMetric::Cosine);
        idx.build(vec![vec![10.0, 0.0, 0.0], vec![0.6, 0.8, 0.0]])
            .unwrap();
        let hits = idx.search(&[3.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].id, 0);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_search_returns_min_of_k_and_len() {
        let mut idx = index(SimilarityMetric::Dot);
        idx.build(pseudo_random_vectors(5, 3)).unwrap();
        assert_eq!(idx.search(&[1.0, 1.0, 1.0], 3).unwrap().len(), 3);
        assert_eq!(idx.search(&[1.0, 1.0, 1.0], 50).unwrap().len(), 5);
    }

    #[test]
    fn test_search_argument_errors() {
        let idx = index(SimilarityMetric::Dot);
        assert!(matches!(
            idx.search(&[1.0, 0.0, 0.0], 0),
            Err(RagError::InvalidArgument(_))
        ));
        assert!(matches!(
            idx.search(&[1.0, 0.0], 1),
            Err(RagError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_index_returns_empty() {
        let idx = index(SimilarityMetric::Cosine);
        assert!(idx.search(&[0.1, 0.2, 0.3], 4).unwrap().is_empty());
    }

    #[test]
    fn test_save_load_reproduces_search() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vectors.bin");

        let mut idx = VectorIndex::new(8, SimilarityMetric::Cosine, IndexStrategy::Exact).unwrap();
        idx.build(pseudo_random_vectors(40, 8)).unwrap();
        let saved_digest = idx.save(&path).unwrap();

        let (loaded, digest) = VectorIndex::load(&path).unwrap();
        assert_eq!(digest, saved_digest);
        assert_eq!(loaded.len(), 40);
        assert_eq!(loaded.metric(), SimilarityMetric::Cosine);

        for query in pseudo_random_vectors(5, 8) {
            assert_eq!(idx.search(&query, 7).unwrap(), loaded.search(&query, 7).unwrap());
        }
    }

    #[test]
    fn test_save_load_empty_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vectors.bin");
        let idx = index(SimilarityMetric::Dot);
        idx.save(&path).unwrap();

        let (loaded, _) = VectorIndex::load(&path).unwrap();
        assert!(loaded.is_empty());
        assert!(loaded.search(&[1.0, 0.0, 0.0], 1).unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_and_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vectors.bin");
        assert!(matches!(
            VectorIndex::load(&path),
            Err(RagError::SnapshotNotFound(_))
        ));

        let mut idx = index(SimilarityMetric::Dot);
        idx.build(pseudo_random_vectors(10, 3)).unwrap();
        idx.save(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            VectorIndex::load(&path),
            Err(RagError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_hnsw_finds_stored_vectors_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vectors.bin");
        let data = pseudo_random_vectors(200, 16);

        let mut idx = VectorIndex::new(16, SimilarityMetric::Cosine, IndexStrategy::Hnsw).unwrap();
        idx.build(data.clone()).unwrap();

        let hits = idx.search(&data[17], 5).unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].id, 17);
        assert!(hits.windows(2).all(|w| rank(&w[0], &w[1]) != Ordering::Greater));

        idx.save(&path).unwrap();
        let (loaded, _) = VectorIndex::load(&path).unwrap();
        for query in data.iter().take(10) {
            assert_eq!(idx.search(query, 5).unwrap(), loaded.search(query, 5).unwrap());
        }
    }

    #[test]
    fn test_hnsw_dot_with_k_beyond_len_matches_exact() {
        let data = pseudo_random_vectors(120, 8);
        let mut hnsw = VectorIndex::new(8, SimilarityMetric::Dot, IndexStrategy::Hnsw).unwrap();
        let mut exact = VectorIndex::new(8, SimilarityMetric::Dot, IndexStrategy::Exact).unwrap();
        hnsw.build(data.clone()).unwrap();
        exact.build(data.clone()).unwrap();

        let hits = hnsw.search(&data[3], 130).unwrap();
        assert_eq!(hits.len(), 120);
        assert_eq!(hits, exact.search(&data[3], 130).unwrap());
        assert_eq!(hnsw.search(&data[3], 100).unwrap().len(), 100);
    }

    #[test]
    fn test_small_hnsw_index_searches_exactly() {
        let mut hnsw = VectorIndex::new(4, SimilarityMetric::Dot, IndexStrategy::Hnsw).unwrap();
        let mut exact = VectorIndex::new(4, SimilarityMetric::Dot, IndexStrategy::Exact).unwrap();
        let data = pseudo_random_vectors(HNSW_MIN_RECORDS - 1, 4);
        hnsw.build(data.clone()).unwrap();
        exact.build(data).unwrap();

        let query = [0.5, -0.25, 1.0, 0.0];
        assert_eq!(hnsw.search(&query, 10).unwrap(), exact.search(&query, 10).unwrap());
    }
}
