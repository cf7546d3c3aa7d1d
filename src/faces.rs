//! Face clustering and person matching.
//!
//! Groups face descriptors by single-linkage over cosine similarity and
//! matches unassigned faces against the reference descriptors of known
//! persons. Matching runs as an explicit pass; only one pass may be
//! active at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use crate::config::FacesConfig;
use crate::persons::{FaceDescriptor, PersonStore};
use crate::similarity::{self, SimilarityError};

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("a matching pass is already running")]
    PassInProgress,
    #[error(transparent)]
    Similarity(#[from] SimilarityError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A connected component of mutually similar faces.
#[derive(Debug, Clone, Serialize)]
pub struct FaceCluster {
    pub face_ids: Vec<u64>,
}

impl FaceCluster {
    /// Clusters of at least two faces are worth turning into a person.
    pub fn promotable(&self) -> bool {
        self.face_ids.len() >= 2
    }
}

/// A face that was automatically attached to a person.
#[derive(Debug, Clone, Serialize)]
pub struct AutoMatch {
    pub face_id: u64,
    pub person_id: u64,
    pub similarity: f32,
}

/// A face close enough to a person to surface for review, but not close
/// enough to assign on its own.
#[derive(Debug, Clone, Serialize)]
pub struct MatchSuggestion {
    pub face_id: u64,
    pub person_id: u64,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoMatchOutcome {
    pub matched: Vec<AutoMatch>,
    pub suggestions: Vec<MatchSuggestion>,
    /// Promotable groups among the faces that stayed unassigned.
    pub clusters: Vec<FaceCluster>,
}

/// Per-pass threshold overrides; unset fields fall back to the config.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMatchOptions {
    pub auto_threshold: Option<f32>,
    pub suggest_threshold: Option<f32>,
}

/// Union-find over face indices with path halving and union by rank.
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(len: usize) -> DisjointSet {
        DisjointSet {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Single-linkage clustering: faces whose descriptors reach `threshold`
/// cosine similarity share a cluster, directly or through intermediates.
///
/// Faces without descriptors are ignored. Clusters come back ordered by
/// their smallest face id, members sorted, so repeated runs over the same
/// faces produce identical output.
pub fn cluster(faces: &[FaceDescriptor], threshold: f32) -> Result<Vec<FaceCluster>, FaceError> {
    let described: Vec<(&FaceDescriptor, &Vec<f32>)> = {
        let mut v: Vec<_> = faces
            .iter()
            .filter_map(|f| f.descriptor.as_ref().map(|d| (f, d)))
            .collect();
        v.sort_by_key(|(f, _)| f.id);
        v
    };

    let mut set = DisjointSet::new(described.len());
    for i in 0..described.len() {
        for j in (i + 1)..described.len() {
            let score = similarity::cosine(described[i].1, described[j].1)?;
            if score >= threshold {
                set.union(i, j);
            }
        }
    }

    let mut components: HashMap<usize, Vec<u64>> = HashMap::new();
    for (idx, (face, _)) in described.iter().enumerate() {
        components.entry(set.find(idx)).or_default().push(face.id);
    }

    let mut clusters: Vec<FaceCluster> = components
        .into_values()
        .map(|mut face_ids| {
            face_ids.sort_unstable();
            FaceCluster { face_ids }
        })
        .collect();
    clusters.sort_by_key(|c| c.face_ids[0]);

    Ok(clusters)
}

pub struct FaceClusterer {
    store: Arc<dyn PersonStore>,
    config: FacesConfig,
    pass_guard: Mutex<()>,
}

impl FaceClusterer {
    pub fn new(store: Arc<dyn PersonStore>, config: FacesConfig) -> FaceClusterer {
        FaceClusterer {
            store,
            config,
            pass_guard: Mutex::new(()),
        }
    }

    /// One matching pass: compare every unassigned, unprocessed face
    /// with a descriptor against each person's reference descriptors,
    /// assign the clear matches, queue the borderline ones as
    /// suggestions, and cluster whatever stays unassigned.
    ///
    /// Fails fast with [`FaceError::PassInProgress`] when another pass
    /// holds the guard.
    pub fn auto_match(&self, options: AutoMatchOptions) -> Result<AutoMatchOutcome, FaceError> {
        let _pass = self
            .pass_guard
            .try_lock()
            .map_err(|_| FaceError::PassInProgress)?;

        let auto_threshold = options
            .auto_threshold
            .unwrap_or(self.config.auto_match_threshold);
        let suggest_threshold = options
            .suggest_threshold
            .unwrap_or(self.config.suggest_threshold);

        let faces = self.store.all_faces()?;

        let mut references: HashMap<u64, Vec<&Vec<f32>>> = HashMap::new();
        for face in &faces {
            if let (Some(person_id), Some(descriptor)) = (face.person_id, &face.descriptor) {
                references.entry(person_id).or_default().push(descriptor);
            }
        }

        let mut candidates: Vec<&FaceDescriptor> = faces
            .iter()
            .filter(|f| f.person_id.is_none() && !f.processed && f.descriptor.is_some())
            .collect();
        candidates.sort_by_key(|f| f.id);

        let mut matched = Vec::new();
        let mut suggestions = Vec::new();
        for face in &candidates {
            let descriptor = face.descriptor.as_ref().unwrap();

            let mut best: Option<(u64, f32)> = None;
            for (&person_id, reference_set) in &references {
                for reference in reference_set {
                    let score = match similarity::cosine(descriptor, reference) {
                        Ok(score) => score,
                        Err(err) => {
                            // A stale descriptor should not kill the pass
                            log::warn!(
                                "Skipping reference comparison for face {}: {err}",
                                face.id
                            );
                            continue;
                        }
                    };
                    let better = match best {
                        None => true,
                        Some((best_id, best_score)) => {
                            score > best_score || (score == best_score && person_id < best_id)
                        }
                    };
                    if better {
                        best = Some((person_id, score));
                    }
                }
            }

            let Some((person_id, score)) = best else {
                continue;
            };

            if score >= auto_threshold {
                self.store.assign_face(face.id, person_id)?;
                log::info!(
                    "Auto-assigned face {} to person {person_id} at {score:.3}",
                    face.id
                );
                matched.push(AutoMatch {
                    face_id: face.id,
                    person_id,
                    similarity: score,
                });
            } else if score >= suggest_threshold {
                // Mark handled so the next pass does not re-suggest it
                self.store.set_processed(face.id, true)?;
                suggestions.push(MatchSuggestion {
                    face_id: face.id,
                    person_id,
                    similarity: score,
                });
            }
        }

        let remaining: Vec<FaceDescriptor> = self
            .store
            .all_faces()?
            .into_iter()
            .filter(|f| f.person_id.is_none() && f.descriptor.is_some())
            .collect();
        let clusters: Vec<FaceCluster> = cluster(&remaining, self.config.cluster_threshold)?
            .into_iter()
            .filter(FaceCluster::promotable)
            .collect();

        log::info!(
            "Face pass: {} matched, {} suggested, {} clusters",
            matched.len(),
            suggestions.len(),
            clusters.len()
        );

        Ok(AutoMatchOutcome {
            matched,
            suggestions,
            clusters,
        })
    }

    /// Group the unassigned described faces into promotable clusters
    /// without touching any assignment.
    pub fn cluster_unassigned(&self) -> Result<Vec<FaceCluster>, FaceError> {
        let unassigned: Vec<FaceDescriptor> = self
            .store
            .all_faces()?
            .into_iter()
            .filter(|f| f.person_id.is_none() && f.descriptor.is_some())
            .collect();
        Ok(cluster(&unassigned, self.config.cluster_threshold)?
            .into_iter()
            .filter(FaceCluster::promotable)
            .collect())
    }

    /// Manually attach a face to a person. Safe to repeat.
    pub fn assign_to_person(&self, face_id: u64, person_id: u64) -> Result<FaceDescriptor, FaceError> {
        Ok(self.store.assign_face(face_id, person_id)?)
    }

    /// Detach a face and make it eligible for matching again. Safe to
    /// repeat.
    pub fn unmatch_face(&self, face_id: u64) -> Result<FaceDescriptor, FaceError> {
        Ok(self.store.unassign_face(face_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persons::{BackendCsv, FaceCreate, PersonCreate};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_store() -> BackendCsv {
        let dir = std::env::temp_dir().join(format!(
            "pix-faces-test-{}-{}",
            std::process::id(),
            TEST_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        BackendCsv::load(
            dir.join("persons.csv").to_str().unwrap(),
            dir.join("faces.csv").to_str().unwrap(),
        )
        .unwrap()
    }

    /// Unit vector at `angle` radians from the x axis, so cosine against
    /// `[1, 0]` is exactly `cos(angle)`.
    fn rotated(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    fn face_with(store: &BackendCsv, descriptor: Vec<f32>) -> u64 {
        store
            .create_face(FaceCreate {
                photo_id: 1,
                confidence: 1.0,
                bbox: None,
                descriptor: Some(descriptor),
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_two_groups_form_two_clusters() {
        let faces = vec![
            FaceDescriptor { id: 0, descriptor: Some(vec![1.0, 0.0, 0.0]), ..Default::default() },
            FaceDescriptor { id: 1, descriptor: Some(vec![0.98, 0.1, 0.0]), ..Default::default() },
            FaceDescriptor { id: 2, descriptor: Some(vec![0.95, 0.05, 0.1]), ..Default::default() },
            FaceDescriptor { id: 3, descriptor: Some(vec![0.0, 1.0, 0.0]), ..Default::default() },
            FaceDescriptor { id: 4, descriptor: Some(vec![0.1, 0.97, 0.0]), ..Default::default() },
            FaceDescriptor { id: 5, descriptor: Some(vec![0.0, 0.93, 0.12]), ..Default::default() },
        ];

        let clusters = cluster(&faces, 0.6).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].face_ids, vec![0, 1, 2]);
        assert_eq!(clusters[1].face_ids, vec![3, 4, 5]);
        assert!(clusters.iter().all(FaceCluster::promotable));
    }

    #[test]
    fn test_singleton_cluster_not_promotable() {
        let faces = vec![
            FaceDescriptor { id: 10, descriptor: Some(vec![1.0, 0.0]), ..Default::default() },
            FaceDescriptor { id: 11, descriptor: Some(vec![0.0, 1.0]), ..Default::default() },
        ];

        let clusters = cluster(&faces, 0.6).unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| !c.promotable()));
    }

    #[test]
    fn test_cluster_links_through_intermediates() {
        // 0°, 40° and 80°: the ends are below a 0.75 threshold but both
        // reach the middle, so single linkage joins all three.
        let faces = vec![
            FaceDescriptor { id: 0, descriptor: Some(rotated(0.0)), ..Default::default() },
            FaceDescriptor { id: 1, descriptor: Some(rotated(0.7)), ..Default::default() },
            FaceDescriptor { id: 2, descriptor: Some(rotated(1.4)), ..Default::default() },
        ];

        let clusters = cluster(&faces, 0.75).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].face_ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_cluster_skips_faces_without_descriptors() {
        let faces = vec![
            FaceDescriptor { id: 0, descriptor: Some(vec![1.0, 0.0]), ..Default::default() },
            FaceDescriptor { id: 1, descriptor: None, manual: true, ..Default::default() },
        ];

        let clusters = cluster(&faces, 0.5).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].face_ids, vec![0]);
    }

    #[test]
    fn test_auto_match_thresholds() {
        let store = test_store();
        let person = store
            .create_person(PersonCreate { name: "Alice".to_string(), ..Default::default() })
            .unwrap();

        // Reference descriptor for Alice
        let reference = face_with(&store, rotated(0.0));
        store.assign_face(reference, person.id).unwrap();

        let clear = face_with(&store, rotated(0.92f32.acos()));
        let borderline = face_with(&store, rotated(0.65f32.acos()));
        let unrelated = face_with(&store, rotated(0.3f32.acos()));

        let clusterer = Arc::new(FaceClusterer::new(
            Arc::new(store.clone()),
            FacesConfig::default(),
        ));
        let outcome = clusterer.auto_match(AutoMatchOptions::default()).unwrap();

        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].face_id, clear);
        assert_eq!(outcome.matched[0].person_id, person.id);
        assert!(outcome.matched[0].similarity > 0.9);

        assert_eq!(outcome.suggestions.len(), 1);
        assert_eq!(outcome.suggestions[0].face_id, borderline);

        let assigned = store.get_face(clear).unwrap().unwrap();
        assert_eq!(assigned.person_id, Some(person.id));
        assert!(assigned.processed);

        let suggested = store.get_face(borderline).unwrap().unwrap();
        assert_eq!(suggested.person_id, None);
        assert!(suggested.processed);

        let untouched = store.get_face(unrelated).unwrap().unwrap();
        assert_eq!(untouched.person_id, None);
        assert!(!untouched.processed);
    }

    #[test]
    fn test_auto_match_second_pass_is_quiet() {
        let store = test_store();
        let person = store
            .create_person(PersonCreate { name: "Bob".to_string(), ..Default::default() })
            .unwrap();
        let reference = face_with(&store, rotated(0.0));
        store.assign_face(reference, person.id).unwrap();

        face_with(&store, rotated(0.05));
        face_with(&store, rotated(0.7));

        let clusterer = FaceClusterer::new(Arc::new(store), FacesConfig::default());
        let first = clusterer.auto_match(AutoMatchOptions::default()).unwrap();
        assert_eq!(first.matched.len(), 1);
        assert_eq!(first.suggestions.len(), 1);

        let second = clusterer.auto_match(AutoMatchOptions::default()).unwrap();
        assert!(second.matched.is_empty());
        assert!(second.suggestions.is_empty());
    }

    #[test]
    fn test_unmatch_makes_face_eligible_again() {
        let store = test_store();
        let person = store
            .create_person(PersonCreate { name: "Carol".to_string(), ..Default::default() })
            .unwrap();
        let reference = face_with(&store, rotated(0.0));
        store.assign_face(reference, person.id).unwrap();
        let near = face_with(&store, rotated(0.1));

        let clusterer = FaceClusterer::new(Arc::new(store.clone()), FacesConfig::default());
        assert_eq!(clusterer.auto_match(AutoMatchOptions::default()).unwrap().matched.len(), 1);

        clusterer.unmatch_face(near).unwrap();
        let face = store.get_face(near).unwrap().unwrap();
        assert_eq!(face.person_id, None);
        assert!(!face.processed);

        // Repeating the unmatch is a no-op
        clusterer.unmatch_face(near).unwrap();

        let again = clusterer.auto_match(AutoMatchOptions::default()).unwrap();
        assert_eq!(again.matched.len(), 1);
        assert_eq!(again.matched[0].face_id, near);
    }

    #[test]
    fn test_assign_is_idempotent() {
        let store = test_store();
        let person = store
            .create_person(PersonCreate { name: "Dave".to_string(), ..Default::default() })
            .unwrap();
        let face = face_with(&store, rotated(0.0));

        let clusterer = FaceClusterer::new(Arc::new(store.clone()), FacesConfig::default());
        clusterer.assign_to_person(face, person.id).unwrap();
        clusterer.assign_to_person(face, person.id).unwrap();

        assert_eq!(store.get_face(face).unwrap().unwrap().person_id, Some(person.id));
    }

    #[test]
    fn test_only_one_pass_at_a_time() {
        let store = test_store();
        let clusterer = FaceClusterer::new(Arc::new(store), FacesConfig::default());

        let _held = clusterer.pass_guard.lock().unwrap();
        assert!(matches!(
            clusterer.auto_match(AutoMatchOptions::default()),
            Err(FaceError::PassInProgress)
        ));
    }

    #[test]
    fn test_outcome_clusters_cover_leftover_faces() {
        let store = test_store();
        // No persons at all: everything stays unassigned
        face_with(&store, rotated(0.0));
        face_with(&store, rotated(0.05));
        face_with(&store, rotated(1.5));

        let clusterer = FaceClusterer::new(Arc::new(store), FacesConfig::default());
        let outcome = clusterer.auto_match(AutoMatchOptions::default()).unwrap();

        assert!(outcome.matched.is_empty());
        // Only the pair is promotable; the lone face is dropped
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.clusters[0].face_ids.len(), 2);
    }
}
