//! The in-memory embedding index behind semantic search.
//!
//! Holds photo embeddings and answers nearest-neighbour queries. Small
//! collections are scanned exhaustively; once the collection grows past
//! `size_threshold` and `rebuild` has run, queries only scan the buckets
//! of the most promising clusters.

use std::collections::HashMap;

use serde::Serialize;

use crate::similarity;

/// Number of k-means refinement passes during `rebuild`.
const KMEANS_ITERATIONS: usize = 10;

const DEFAULT_SIZE_THRESHOLD: usize = 1000;
const DEFAULT_CLUSTERS: usize = 16;
const DEFAULT_PROBES: usize = 3;

/// One stored embedding plus the caption hash it was generated from.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub content_hash: u64,
    pub embedding: Vec<f32>,
}

/// A scored nearest-neighbour match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub photo_id: u64,
    /// Cosine similarity against the query
    pub score: f32,
}

/// Per-call search parameters.
#[derive(Debug, Clone)]
pub struct VectorSearchOptions {
    pub limit: usize,
    /// Matches scoring below this are dropped
    pub threshold: f32,
    /// Clusters to probe when the clustered layout is active.
    /// `None` uses the index default.
    pub num_probes: Option<usize>,
}

impl Default for VectorSearchOptions {
    fn default() -> Self {
        VectorSearchOptions {
            limit: 10,
            threshold: 0.0,
            num_probes: None,
        }
    }
}

/// Snapshot of the index shape, surfaced by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub vectors: usize,
    pub dimensions: usize,
    pub clusters: usize,
    pub built: bool,
    pub mode: String,
}

/// Embeddings keyed by photo id, with incremental insert/remove and an
/// optional k-means cluster layout that keeps large collections from
/// paying for a full scan per query.
pub struct VectorIndex {
    entries: HashMap<u64, VectorEntry>,
    dimensions: usize,
    /// Collection size below which searches always scan everything
    size_threshold: usize,
    num_clusters: usize,
    num_probes: usize,
    centroids: Vec<Vec<f32>>,
    /// Photo IDs assigned to each centroid
    buckets: Vec<Vec<u64>>,
    built: bool,
}

impl VectorIndex {
    /// An empty index with the default cluster layout.
    pub fn new(dimensions: usize) -> Self {
        Self::with_layout(
            dimensions,
            DEFAULT_SIZE_THRESHOLD,
            DEFAULT_CLUSTERS,
            DEFAULT_PROBES,
        )
    }

    /// Create an index with explicit cluster layout parameters.
    pub fn with_layout(
        dimensions: usize,
        size_threshold: usize,
        num_clusters: usize,
        num_probes: usize,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
            size_threshold,
            num_clusters: num_clusters.max(1),
            num_probes: num_probes.max(1),
            centroids: Vec::new(),
            buckets: Vec::new(),
            built: false,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, photo_id: u64) -> bool {
        self.entries.contains_key(&photo_id)
    }

    pub fn get(&self, photo_id: u64) -> Option<&VectorEntry> {
        self.entries.get(&photo_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Whether searches currently go through cluster buckets instead of a
    /// full scan.
    pub fn clustered_search_active(&self) -> bool {
        self.built && self.entries.len() >= self.size_threshold
    }

    /// Current shape of the index.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            vectors: self.entries.len(),
            dimensions: self.dimensions,
            clusters: self.centroids.len(),
            built: self.built,
            mode: if self.clustered_search_active() {
                "clustered".to_string()
            } else {
                "exhaustive".to_string()
            },
        }
    }

    /// Insert or replace the embedding for a photo.
    ///
    /// With a built cluster layout the vector joins its nearest bucket
    /// without retraining; `rebuild` retrains centroids. Zero-norm
    /// vectors are refused, they cannot participate in cosine scoring.
    pub fn insert(
        &mut self,
        photo_id: u64,
        content_hash: u64,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        let norm = similarity::norm(&embedding);
        if norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        if self.entries.contains_key(&photo_id) {
            self.purge_from_buckets(photo_id);
        }
        if self.built {
            let (bucket, _) = self.nearest_centroid(&embedding, norm);
            self.buckets[bucket].push(photo_id);
        }

        self.entries.insert(
            photo_id,
            VectorEntry {
                content_hash,
                embedding,
            },
        );

        Ok(())
    }

    pub fn remove(&mut self, photo_id: u64) -> Option<VectorEntry> {
        let removed = self.entries.remove(&photo_id);
        if removed.is_some() {
            self.purge_from_buckets(photo_id);
        }
        removed
    }

    fn purge_from_buckets(&mut self, photo_id: u64) {
        for bucket in &mut self.buckets {
            bucket.retain(|&id| id != photo_id);
        }
    }

    /// Retrain the cluster layout from scratch with k-means.
    ///
    /// Deterministic for a given set of entries: IDs are processed in
    /// ascending order and centroids seed from evenly spaced vectors.
    pub fn rebuild(&mut self) {
        self.centroids.clear();
        self.buckets.clear();
        self.built = false;

        if self.entries.is_empty() {
            return;
        }

        let mut ids: Vec<u64> = self.entries.keys().copied().collect();
        ids.sort_unstable();

        let k = self.num_clusters.min(ids.len());
        self.centroids = (0..k)
            .map(|i| self.entries[&ids[i * ids.len() / k]].embedding.clone())
            .collect();

        let mut assigned: Vec<Vec<u64>> = vec![Vec::new(); k];
        for _ in 0..KMEANS_ITERATIONS {
            assigned = vec![Vec::new(); k];
            let mut placement: HashMap<u64, (usize, f32)> = HashMap::new();
            for &id in &ids {
                let embedding = &self.entries[&id].embedding;
                let placed = self.nearest_centroid(embedding, similarity::norm(embedding));
                assigned[placed.0].push(id);
                placement.insert(id, placed);
            }

            self.reseed_empty_clusters(&ids, &mut assigned, &mut placement);

            let mut changed = false;
            for (ci, members) in assigned.iter().enumerate() {
                if members.is_empty() {
                    continue;
                }
                let centroid = self.mean_of(members);
                if centroid != self.centroids[ci] {
                    self.centroids[ci] = centroid;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        self.buckets = assigned;
        self.built = true;
        log::debug!("rebuilt vector index: {} vectors in {k} clusters", ids.len());
    }

    /// Re-seed each empty cluster with the vector farthest from its current
    /// centroid, drawn from clusters that keep at least one member.
    fn reseed_empty_clusters(
        &mut self,
        ids: &[u64],
        assigned: &mut [Vec<u64>],
        placement: &mut HashMap<u64, (usize, f32)>,
    ) {
        for ci in 0..assigned.len() {
            if !assigned[ci].is_empty() {
                continue;
            }
            let donor = ids
                .iter()
                .filter(|id| assigned[placement[*id].0].len() > 1)
                .min_by(|a, b| {
                    placement[*a]
                        .1
                        .partial_cmp(&placement[*b].1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied();
            let Some(donor_id) = donor else {
                // Nothing left to donate
                break;
            };
            let donor_cluster = placement[&donor_id].0;
            assigned[donor_cluster].retain(|&id| id != donor_id);
            assigned[ci].push(donor_id);
            placement.insert(donor_id, (ci, 1.0));
            self.centroids[ci] = self.entries[&donor_id].embedding.clone();
        }
    }

    fn mean_of(&self, members: &[u64]) -> Vec<f32> {
        let mut mean = vec![0.0; self.dimensions];
        for id in members {
            for (m, v) in mean.iter_mut().zip(&self.entries[id].embedding) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= members.len() as f32;
        }
        mean
    }

    fn nearest_centroid(&self, embedding: &[f32], norm: f32) -> (usize, f32) {
        let mut best = (0, f32::MIN);
        for (ci, centroid) in self.centroids.iter().enumerate() {
            let score = similarity::cosine_with_query_norm(embedding, centroid, norm);
            if score > best.1 {
                best = (ci, score);
            }
        }
        best
    }

    /// Clusters ranked by similarity to the query, best first.
    fn ranked_clusters(&self, query: &[f32], query_norm: f32) -> Vec<usize> {
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(ci, centroid)| {
                (ci, similarity::cosine_with_query_norm(query, centroid, query_norm))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().map(|(ci, _)| ci).collect()
    }

    /// Top matches for a query vector, best first, ties broken by
    /// ascending photo id.
    pub fn search(
        &self,
        query: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = similarity::norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut results = if self.clustered_search_active() {
            let probes = options
                .num_probes
                .unwrap_or(self.num_probes)
                .clamp(1, self.centroids.len());
            let mut hits = Vec::new();
            for ci in self.ranked_clusters(query, query_norm).into_iter().take(probes) {
                self.score_candidates(
                    self.buckets[ci].iter().copied(),
                    query,
                    query_norm,
                    options.threshold,
                    &mut hits,
                );
            }
            hits
        } else {
            let mut hits = Vec::with_capacity(self.entries.len());
            self.score_candidates(
                self.entries.keys().copied(),
                query,
                query_norm,
                options.threshold,
                &mut hits,
            );
            hits
        };

        // Sort by score descending, photo ID ascending on equal scores
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.photo_id.cmp(&b.photo_id))
        });

        results.truncate(options.limit);

        Ok(results)
    }

    fn score_candidates(
        &self,
        candidates: impl Iterator<Item = u64>,
        query: &[f32],
        query_norm: f32,
        threshold: f32,
        out: &mut Vec<SearchHit>,
    ) {
        for photo_id in candidates {
            let Some(entry) = self.entries.get(&photo_id) else {
                log::debug!("skipping stale bucket entry for photo {photo_id}");
                continue;
            };
            if entry.embedding.len() != self.dimensions {
                log::warn!(
                    "skipping corrupt embedding for photo {photo_id}: {} dims, index expects {}",
                    entry.embedding.len(),
                    self.dimensions
                );
                continue;
            }
            let score = similarity::cosine_with_query_norm(query, &entry.embedding, query_norm);
            if score >= threshold {
                out.push(SearchHit { photo_id, score });
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("zero-norm vectors cannot be stored or searched")]
    ZeroNormVector,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(limit: usize) -> VectorSearchOptions {
        VectorSearchOptions {
            limit,
            threshold: 0.0,
            num_probes: None,
        }
    }

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new(384);
        assert_eq!(index.dimensions(), 384);
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
        assert_eq!(index.stats().mode, "exhaustive");
    }

    #[test]
    fn test_insert_and_get() {
        let mut index = VectorIndex::new(3);
        let embedding = vec![1.0, 0.0, 0.0];

        index.insert(1, 12345, embedding.clone()).unwrap();

        assert_eq!(index.len(), 1);
        assert!(index.contains(1));

        let entry = index.get(1).unwrap();
        assert_eq!(entry.content_hash, 12345);
        assert_eq!(entry.embedding, embedding);
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut index = VectorIndex::new(3);
        let wrong_dims = vec![1.0, 0.0, 0.0, 0.0]; // 4 dims

        let result = index.insert(1, 12345, wrong_dims);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_insert_zero_norm_rejected() {
        let mut index = VectorIndex::new(3);
        let zero_vec = vec![0.0, 0.0, 0.0];

        let result = index.insert(1, 12345, zero_vec);
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn test_update_replaces_embedding() {
        let mut index = VectorIndex::new(2);
        index.insert(1, 100, vec![1.0, 0.0]).unwrap();
        index.insert(1, 101, vec![0.0, 1.0]).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(1).unwrap().content_hash, 101);
        let results = index.search(&[0.0, 1.0], &options(1)).unwrap();
        assert!(results[0].score > 0.99);
    }

    #[test]
    fn test_remove() {
        let mut index = VectorIndex::new(3);
        index.insert(1, 12345, vec![1.0, 0.0, 0.0]).unwrap();

        let removed = index.remove(1);
        assert!(removed.is_some());
        assert!(index.remove(1).is_none());
        assert!(!index.contains(1));
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_basic() {
        let mut index = VectorIndex::new(3);

        index.insert(1, 100, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(2, 200, vec![0.0, 1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.1, 0.0], &options(10)).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].photo_id, 1);
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_search_with_threshold() {
        let mut index = VectorIndex::new(3);

        index.insert(1, 100, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(2, 200, vec![0.0, 1.0, 0.0]).unwrap();

        let opts = VectorSearchOptions {
            limit: 10,
            threshold: 0.9,
            num_probes: None,
        };
        let results = index.search(&[1.0, 0.0, 0.0], &opts).unwrap();

        // Only the aligned vector clears 0.9
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].photo_id, 1);
        assert!((results[0].score - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_search_with_limit() {
        let mut index = VectorIndex::new(3);

        for i in 0..10 {
            index
                .insert(i, i * 100, vec![1.0, i as f32 * 0.1, 0.0])
                .unwrap();
        }

        let results = index.search(&[1.0, 0.0, 0.0], &options(3)).unwrap();

        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_search_zero_norm_query_rejected() {
        let mut index = VectorIndex::new(2);
        index.insert(1, 100, vec![1.0, 0.0]).unwrap();

        let result = index.search(&[0.0, 0.0], &options(10));
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn test_tie_break_by_photo_id() {
        let mut index = VectorIndex::new(2);
        index.insert(9, 0, vec![1.0, 0.0]).unwrap();
        index.insert(3, 0, vec![1.0, 0.0]).unwrap();
        index.insert(6, 0, vec![1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], &options(3)).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.photo_id).collect();
        assert_eq!(ids, vec![3, 6, 9]);
    }

    /// Two well-separated groups on different axes, sized so that the
    /// cluster layout is actually used after rebuild.
    fn clustered_index() -> VectorIndex {
        let mut index = VectorIndex::with_layout(3, 4, 2, 1);
        for i in 0..10u64 {
            let wobble = i as f32 * 0.01;
            index.insert(i, 0, vec![1.0, wobble, 0.0]).unwrap();
            index.insert(100 + i, 0, vec![0.0, wobble, 1.0]).unwrap();
        }
        index.rebuild();
        index
    }

    #[test]
    fn test_rebuild_clusters_and_probes() {
        let index = clustered_index();
        assert!(index.clustered_search_active());
        assert_eq!(index.stats().mode, "clustered");
        assert_eq!(index.stats().clusters, 2);

        // Probing a single cluster only surfaces the group on the query axis
        let results = index.search(&[1.0, 0.0, 0.0], &options(20)).unwrap();
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.photo_id < 100));
    }

    #[test]
    fn test_probe_all_matches_exhaustive() {
        let index = clustered_index();
        let all = VectorSearchOptions {
            limit: 100,
            threshold: 0.0,
            num_probes: Some(2),
        };
        let clustered = index.search(&[1.0, 0.2, 0.0], &all).unwrap();

        let mut flat = VectorIndex::new(3);
        for (id, entry) in index.iter() {
            flat.insert(id, entry.content_hash, entry.embedding.clone())
                .unwrap();
        }
        let exhaustive = flat.search(&[1.0, 0.2, 0.0], &all).unwrap();
        assert_eq!(clustered, exhaustive);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let a = clustered_index();
        let b = clustered_index();
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.buckets, b.buckets);
    }

    #[test]
    fn test_insert_after_rebuild_is_searchable() {
        let mut index = clustered_index();
        index.insert(500, 0, vec![0.99, 0.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], &options(30)).unwrap();
        assert!(results.iter().any(|r| r.photo_id == 500));
    }

    #[test]
    fn test_remove_after_rebuild_purges_buckets() {
        let mut index = clustered_index();
        index.remove(3).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], &options(30)).unwrap();
        assert!(results.iter().all(|r| r.photo_id != 3));
        assert!(index.buckets.iter().all(|b| !b.contains(&3)));
    }

    #[test]
    fn test_rebuild_leaves_no_empty_clusters() {
        // Identical vectors would leave k-1 clusters empty without reseeding
        let mut index = VectorIndex::with_layout(2, 2, 4, 4);
        for i in 0..8u64 {
            index.insert(i, 0, vec![1.0, 0.0]).unwrap();
        }
        index.rebuild();
        assert!(index.buckets.iter().all(|b| !b.is_empty()));

        let results = index.search(&[1.0, 0.0], &options(10)).unwrap();
        assert_eq!(results.len(), 8);
    }

    #[test]
    fn test_small_collection_stays_exhaustive() {
        let mut index = VectorIndex::with_layout(2, 1000, 4, 1);
        for i in 0..10u64 {
            index.insert(i, 0, vec![1.0, i as f32 * 0.1]).unwrap();
        }
        index.rebuild();

        // Built, but below the size threshold: still a full scan
        assert!(!index.clustered_search_active());
        assert_eq!(index.stats().mode, "exhaustive");
        let results = index.search(&[1.0, 0.0], &options(20)).unwrap();
        assert_eq!(results.len(), 10);
    }

    #[test]
    fn test_unbuilt_index_searches_exhaustively() {
        let mut index = VectorIndex::with_layout(2, 1, 4, 1);
        for i in 0..6u64 {
            index.insert(i, 0, vec![0.5, i as f32]).unwrap();
        }

        // Over the threshold but never rebuilt: full scan still answers
        let results = index.search(&[0.5, 3.0], &options(10)).unwrap();
        assert_eq!(results.len(), 6);
        assert_eq!(results[0].photo_id, 3);
    }
}
