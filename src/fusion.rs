//! Result fusion across search strategies.
//!
//! Each strategy (keyword, semantic, people) returns its own scored
//! candidate list. Fusion merges them into one deduplicated ranking:
//!
//! - **weighted** (default): `weightedScore = rawScore * sourceWeight`,
//!   duplicates resolved by the configured dedup policy
//! - **rrf**: Reciprocal Rank Fusion, `score += 1/(k + rank + 1)` per
//!   source list; rank beats magnitude, weights are ignored
//!
//! Source weights reflect strategy precision: a person-lookup hit is
//! near-certain, a keyword hit is weaker evidence.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::FusionConfig;

/// RRF constant (standard value from literature).
/// Higher k reduces the impact of high-ranking items.
const RRF_K: f32 = 60.0;

/// Weight multiplier applied to the sources an intent does NOT favor.
const OFF_SOURCE_FACTOR: f32 = 0.8;

/// Which strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Keyword,
    Semantic,
    People,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Keyword => write!(f, "keyword"),
            Source::Semantic => write!(f, "semantic"),
            Source::People => write!(f, "people"),
        }
    }
}

/// A single scored candidate from one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateResult {
    pub photo_id: u64,
    /// Strategy-native score, already normalized to [0, 1]
    pub score: f32,
    pub source: Source,
    /// Strategy-specific extras (matched tokens, person name, ...)
    pub metadata: Option<serde_json::Value>,
}

/// How one source contributed to a merged result.
#[derive(Debug, Clone, Serialize)]
pub struct SourceContribution {
    pub agent: Source,
    pub raw_score: f32,
    pub weight: f32,
    pub weighted_score: f32,
}

/// One photo in the fused ranking. Never contains duplicate photo IDs.
#[derive(Debug, Clone, Serialize)]
pub struct MergedResult {
    pub photo_id: u64,
    pub final_score: f32,
    pub sources: Vec<SourceContribution>,
    /// Number of distinct strategies that returned this photo
    pub matched_agents: usize,
}

/// Duplicate handling when a photo arrives from several sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupStrategy {
    /// Keep the highest weighted score (default)
    #[default]
    HighestScore,
    /// Keep the first source seen, in candidate-list order
    FirstWins,
    /// Mean of weighted scores across matching sources
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMode {
    #[default]
    Weighted,
    Rrf,
}

/// Per-source weights for weighted fusion.
#[derive(Debug, Clone, Copy)]
pub struct SourceWeights {
    pub people: f32,
    pub semantic: f32,
    pub keyword: f32,
}

impl SourceWeights {
    fn for_source(&self, source: Source) -> f32 {
        match source {
            Source::People => self.people,
            Source::Semantic => self.semantic,
            Source::Keyword => self.keyword,
        }
    }

    /// Favor one source by demoting the others. Keeps every weight within
    /// its configured ceiling so weighted scores stay in [0, 1].
    fn emphasize(&mut self, source: Source) {
        match source {
            Source::People => {
                self.semantic *= OFF_SOURCE_FACTOR;
                self.keyword *= OFF_SOURCE_FACTOR;
            }
            Source::Semantic => {
                self.people *= OFF_SOURCE_FACTOR;
                self.keyword *= OFF_SOURCE_FACTOR;
            }
            Source::Keyword => {
                self.people *= OFF_SOURCE_FACTOR;
                self.semantic *= OFF_SOURCE_FACTOR;
            }
        }
    }
}

/// Everything `merge` needs to know for one call.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub mode: FusionMode,
    pub weights: SourceWeights,
    pub dedup: DedupStrategy,
    pub min_score: f32,
    pub max_results: usize,
}

impl MergeOptions {
    /// Build merge options from config, optionally emphasizing the source
    /// the parsed intent points at.
    pub fn for_intent(config: &FusionConfig, boost: Option<Source>) -> Self {
        let mode = match config.mode.as_str() {
            "rrf" => FusionMode::Rrf,
            _ => FusionMode::Weighted,
        };
        let dedup = match config.dedup.as_str() {
            "first-wins" => DedupStrategy::FirstWins,
            "average" => DedupStrategy::Average,
            _ => DedupStrategy::HighestScore,
        };

        let mut weights = SourceWeights {
            people: config.people_weight,
            semantic: config.semantic_weight,
            keyword: config.keyword_weight,
        };
        if let Some(source) = boost {
            weights.emphasize(source);
        }

        // min_score is calibrated to weighted scores; RRF scores live on a
        // 1/(k+1) scale where any positive cutoff would drop everything.
        let min_score = match mode {
            FusionMode::Weighted => config.min_score,
            FusionMode::Rrf => 0.0,
        };

        Self {
            mode,
            weights,
            dedup,
            min_score,
            max_results: config.max_results,
        }
    }
}

/// Merge per-strategy candidate lists into one deduplicated ranking.
///
/// # Returns
/// Results sorted by final score (highest first), ties broken by ascending
/// photo ID, capped at `max_results`.
pub fn merge(candidate_lists: &[Vec<CandidateResult>], options: &MergeOptions) -> Vec<MergedResult> {
    let mut merged: HashMap<u64, MergedResult> = HashMap::new();

    for list in candidate_lists {
        for (rank, candidate) in list.iter().enumerate() {
            let weight = options.weights.for_source(candidate.source);
            let weighted_score = match options.mode {
                FusionMode::Weighted => candidate.score * weight,
                FusionMode::Rrf => 1.0 / (RRF_K + rank as f32 + 1.0),
            };

            let contribution = SourceContribution {
                agent: candidate.source,
                raw_score: candidate.score,
                weight,
                weighted_score,
            };

            merged
                .entry(candidate.photo_id)
                .and_modify(|result| result.sources.push(contribution.clone()))
                .or_insert(MergedResult {
                    photo_id: candidate.photo_id,
                    final_score: 0.0,
                    sources: vec![contribution],
                    matched_agents: 0,
                });
        }
    }

    let mut results: Vec<MergedResult> = merged
        .into_values()
        .map(|mut result| {
            result.final_score = final_score(&result.sources, options);
            result.matched_agents = distinct_agents(&result.sources);
            result
        })
        .filter(|result| result.final_score >= options.min_score)
        .collect();

    // Sort by score descending, photo ID ascending on equal scores
    results.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.photo_id.cmp(&b.photo_id))
    });

    results.truncate(options.max_results);

    results
}

fn final_score(sources: &[SourceContribution], options: &MergeOptions) -> f32 {
    if sources.is_empty() {
        return 0.0;
    }

    match options.mode {
        // RRF accumulates across sources; dedup policy does not apply
        FusionMode::Rrf => sources.iter().map(|s| s.weighted_score).sum(),
        FusionMode::Weighted => match options.dedup {
            DedupStrategy::HighestScore => sources
                .iter()
                .map(|s| s.weighted_score)
                .fold(f32::MIN, f32::max),
            DedupStrategy::FirstWins => sources[0].weighted_score,
            DedupStrategy::Average => {
                sources.iter().map(|s| s.weighted_score).sum::<f32>() / sources.len() as f32
            }
        },
    }
}

fn distinct_agents(sources: &[SourceContribution]) -> usize {
    let mut agents: Vec<Source> = sources.iter().map(|s| s.agent).collect();
    agents.sort_by_key(|a| *a as u8);
    agents.dedup();
    agents.len()
}
