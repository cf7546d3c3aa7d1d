//! Vector similarity math shared by the semantic index and face matching.
//!
//! All pairwise operations validate dimensions up front and refuse to
//! compare vectors of different lengths.

use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// L2 norm of a vector.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between two vectors.
///
/// Returns a score in `[-1, 1]`, or `0.0` when either vector has zero
/// norm. Mismatched dimensions are a hard error.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    check_dims(a.len(), b.len())?;
    Ok(cosine_with_query_norm(a, b, norm(a)))
}

/// Cosine similarity with a precomputed norm for the query side.
///
/// Used on hot paths where the query is scored against many targets.
/// Assumes dimensions were validated when the targets were stored.
pub fn cosine_with_query_norm(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = norm(target);
    if query_norm < f32::EPSILON || target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = query.iter().zip(target.iter()).map(|(x, y)| x * y).sum();
    dot / (query_norm * target_norm)
}

/// Euclidean distance between two vectors.
pub fn euclidean(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    check_dims(a.len(), b.len())?;
    let sum: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    Ok(sum.sqrt())
}

/// Cosine similarity of one query against a batch of targets.
///
/// Scores come back in target order. Any target with a mismatched
/// dimension fails the whole batch.
pub fn batch_cosine(query: &[f32], targets: &[Vec<f32>]) -> Result<Vec<f32>, SimilarityError> {
    let query_norm = norm(query);
    targets
        .par_iter()
        .map(|target| {
            check_dims(query.len(), target.len())?;
            Ok(cosine_with_query_norm(query, target, query_norm))
        })
        .collect()
}

fn check_dims(expected: usize, got: usize) -> Result<(), SimilarityError> {
    if expected != got {
        return Err(SimilarityError::DimensionMismatch { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-6, "expected {b}, got {a}");
    }

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![0.3, 0.5, 0.2];
        assert_close(cosine(&v, &v).unwrap(), 1.0);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_close(cosine(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_opposite_vectors() {
        let a = vec![1.0, 2.0];
        let b = vec![-1.0, -2.0];
        assert_close(cosine(&a, &b).unwrap(), -1.0);
    }

    #[test]
    fn test_cosine_zero_norm_returns_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];
        assert_close(cosine(&zero, &v).unwrap(), 0.0);
        assert_close(cosine(&v, &zero).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(
            cosine(&a, &b),
            Err(SimilarityError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn test_euclidean_right_triangle() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert_close(euclidean(&a, &b).unwrap(), 5.0);
    }

    #[test]
    fn test_euclidean_dimension_mismatch() {
        let a = vec![1.0];
        let b = vec![1.0, 2.0];
        assert!(euclidean(&a, &b).is_err());
    }

    #[test]
    fn test_batch_cosine_matches_single_calls() {
        let query = vec![0.1, 0.9, 0.3];
        let targets = vec![
            vec![0.1, 0.9, 0.3],
            vec![0.9, 0.1, 0.0],
            vec![0.0, 0.0, 0.0],
        ];

        let scores = batch_cosine(&query, &targets).unwrap();
        assert_eq!(scores.len(), 3);
        for (score, target) in scores.iter().zip(targets.iter()) {
            assert_close(*score, cosine(&query, target).unwrap());
        }
    }

    #[test]
    fn test_batch_cosine_fails_on_any_mismatch() {
        let query = vec![0.1, 0.9];
        let targets = vec![vec![0.2, 0.4], vec![0.2, 0.4, 0.6]];
        assert!(batch_cosine(&query, &targets).is_err());
    }
}
