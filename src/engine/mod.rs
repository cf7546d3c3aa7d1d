//! Search orchestration.
//!
//! [`SearchEngine`] owns every search component behind one context struct:
//! the stores, the vector index service, the keyword index, person lookup,
//! the intent parser, face matching and the embedding pipeline. A search
//! parses the query, races the hinted strategies in parallel under a
//! deadline, and fuses whatever came back into one ranking.

pub mod strategies;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::faces::{AutoMatchOptions, AutoMatchOutcome, FaceCluster, FaceClusterer, FaceError};
use crate::fusion::{self, CandidateResult, DedupStrategy, FusionMode, MergeOptions, MergedResult, Source};
use crate::intent::{IntentKind, QueryIntentParser, SearchIntent};
use crate::keyword::{KeywordIndex, KeywordSearchOptions};
use crate::people::{PersonLookup, PersonPhotosOptions};
use crate::persons::{FaceDescriptor, PersonStore};
use crate::photos::{Photo, PhotoCreate, PhotoStore, PhotoUpdate};
use crate::pipeline::{Priority, QueueStats, VectorPipeline};
use crate::semantic::{IndexStats, SearchHit, SemanticService};
use strategies::{StrategyJob, StrategyOutput, StrategyReport};

/// Per-call overrides on top of the configured fusion behavior.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub min_score: Option<f32>,
    pub mode: Option<FusionMode>,
    pub dedup: Option<DedupStrategy>,
}

/// A fused ranking plus everything needed to explain it.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<MergedResult>,
    pub intent: SearchIntent,
    pub strategies: Vec<StrategyReport>,
}

pub struct SearchEngine {
    config: Config,
    photos: Arc<dyn PhotoStore>,
    persons: Arc<dyn PersonStore>,
    semantic: Arc<SemanticService>,
    keyword: Arc<RwLock<KeywordIndex>>,
    people: Arc<PersonLookup>,
    parser: QueryIntentParser,
    clusterer: FaceClusterer,
    pipeline: Arc<VectorPipeline>,
}

impl SearchEngine {
    pub fn new(
        config: Config,
        photos: Arc<dyn PhotoStore>,
        persons: Arc<dyn PersonStore>,
    ) -> anyhow::Result<SearchEngine> {
        let semantic = Arc::new(SemanticService::new(
            config.embedding.clone(),
            config.index.clone(),
            PathBuf::from(config.base_path()),
        ));
        let parser = QueryIntentParser::from_config(&config.intent);
        SearchEngine::assemble(config, photos, persons, semantic, parser)
    }

    /// Wire an engine around an existing service and parser. This is how
    /// tests inject stub embedding providers and canned LLM clients.
    pub fn with_components(
        config: Config,
        photos: Arc<dyn PhotoStore>,
        persons: Arc<dyn PersonStore>,
        semantic: Arc<SemanticService>,
        parser: QueryIntentParser,
    ) -> anyhow::Result<SearchEngine> {
        SearchEngine::assemble(config, photos, persons, semantic, parser)
    }

    fn assemble(
        config: Config,
        photos: Arc<dyn PhotoStore>,
        persons: Arc<dyn PersonStore>,
        semantic: Arc<SemanticService>,
        parser: QueryIntentParser,
    ) -> anyhow::Result<SearchEngine> {
        let mut keyword = KeywordIndex::new();
        for photo in photos.all()? {
            keyword.add_photo(&photo);
        }
        log::debug!("Indexed {} photos for keyword search", keyword.len());

        let people = Arc::new(PersonLookup::new(persons.clone(), photos.clone()));
        let clusterer = FaceClusterer::new(persons.clone(), config.faces.clone());
        let pipeline = Arc::new(VectorPipeline::new(
            semantic.clone(),
            photos.clone(),
            config.base_path(),
            &config.pipeline,
        ));

        Ok(SearchEngine {
            config,
            photos,
            persons,
            semantic,
            keyword: Arc::new(RwLock::new(keyword)),
            people,
            parser,
            clusterer,
            pipeline,
        })
    }

    /// Parse the query, race the hinted strategies, fuse the survivors.
    ///
    /// Individual strategy failures and timeouts never fail the search;
    /// they are reported in the response. Only when every strategy fails
    /// does the ranking come back empty.
    pub fn search(&self, query: &str, options: &SearchOptions) -> anyhow::Result<SearchResponse> {
        let intent = self.parser.parse(query);
        log::debug!(
            "Query parsed as {} (confidence {:.2}, fallback: {})",
            intent.kind,
            intent.confidence,
            intent.fallback_used
        );

        let fetch_limit = (options.limit.unwrap_or(self.config.fusion.max_results) * 2)
            .clamp(20, 200);
        let jobs = self.build_jobs(query, &intent, fetch_limit);
        let timeout = Duration::from_secs(self.config.search.strategy_timeout_secs);
        let reports = strategies::run_all(jobs, timeout);

        if reports.iter().all(|r| !r.success) {
            log::warn!("Every strategy failed for query {query:?}");
        }

        let candidate_lists: Vec<Vec<CandidateResult>> = reports
            .iter()
            .filter(|r| r.success)
            .map(|r| r.results.clone())
            .collect();

        let mut merge_options = MergeOptions::for_intent(&self.config.fusion, intent.boost_source());
        if let Some(mode) = options.mode {
            merge_options.mode = mode;
            merge_options.min_score = match mode {
                FusionMode::Rrf => 0.0,
                FusionMode::Weighted => self.config.fusion.min_score,
            };
        }
        if let Some(limit) = options.limit {
            merge_options.max_results = limit;
        }
        if let Some(min_score) = options.min_score {
            merge_options.min_score = min_score;
        }
        if let Some(dedup) = options.dedup {
            merge_options.dedup = dedup;
        }

        let results = fusion::merge(&candidate_lists, &merge_options);
        Ok(SearchResponse {
            results,
            intent,
            strategies: reports,
        })
    }

    fn build_jobs(&self, query: &str, intent: &SearchIntent, limit: usize) -> Vec<StrategyJob> {
        intent
            .search_hints
            .iter()
            .map(|source| match source {
                Source::Keyword => self.keyword_job(query, limit),
                Source::Semantic => self.semantic_job(intent.refined_query.clone(), limit),
                Source::People => self.people_job(intent, limit),
            })
            .collect()
    }

    /// Keyword search runs on the raw query: stripped entities like a
    /// year are often literal text in titles and file names.
    fn keyword_job(&self, query: &str, limit: usize) -> StrategyJob {
        let index = self.keyword.clone();
        let query = query.to_string();
        StrategyJob {
            source: Source::Keyword,
            run: Box::new(move || {
                let index = index
                    .read()
                    .map_err(|_| "keyword index lock poisoned".to_string())?;
                let hits = index.search(
                    &query,
                    &KeywordSearchOptions {
                        limit: Some(limit),
                        ..Default::default()
                    },
                );

                let confidence = hits.first().map(|h| h.score).unwrap_or(0.0);
                let results = hits
                    .into_iter()
                    .map(|hit| CandidateResult {
                        photo_id: hit.photo_id,
                        score: hit.score,
                        source: Source::Keyword,
                        metadata: Some(json!({
                            "matched_tokens": hit.matched_tokens,
                            "total_tokens": hit.total_tokens,
                        })),
                    })
                    .collect();
                Ok(StrategyOutput { results, confidence })
            }),
        }
    }

    fn semantic_job(&self, refined_query: String, limit: usize) -> StrategyJob {
        let service = self.semantic.clone();
        StrategyJob {
            source: Source::Semantic,
            run: Box::new(move || {
                let hits = service
                    .search_with_scores(&refined_query, None, limit)
                    .map_err(|err| err.to_string())?;

                let confidence = hits.first().map(|h| h.score).unwrap_or(0.0);
                let results = hits
                    .into_iter()
                    .map(|hit| CandidateResult {
                        photo_id: hit.photo_id,
                        score: hit.score.clamp(0.0, 1.0),
                        source: Source::Semantic,
                        metadata: None,
                    })
                    .collect();
                Ok(StrategyOutput { results, confidence })
            }),
        }
    }

    fn people_job(&self, intent: &SearchIntent, limit: usize) -> StrategyJob {
        let people = self.people.clone();
        let mut names: Vec<String> = intent
            .person_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        if names.is_empty() && intent.kind == IntentKind::People {
            // "photos of <name>" style queries where extraction found no
            // entity; the remaining text is the best name guess
            names.push(intent.refined_query.clone());
        }
        let year = intent.year();
        let month = intent.month();

        StrategyJob {
            source: Source::People,
            run: Box::new(move || {
                let mut results: Vec<CandidateResult> = Vec::new();
                let mut seen = HashSet::new();
                let mut confidence = 0.0f32;

                for name in &names {
                    let matches = people.search(name).map_err(|err| err.to_string())?;
                    for person_match in matches {
                        confidence = confidence.max(person_match.score);
                        let photos = people
                            .get_photos(
                                person_match.person.id,
                                &PersonPhotosOptions {
                                    year,
                                    month,
                                    limit: Some(limit),
                                    offset: 0,
                                },
                            )
                            .map_err(|err| err.to_string())?;

                        for photo in photos {
                            if seen.insert(photo.id) {
                                results.push(CandidateResult {
                                    photo_id: photo.id,
                                    score: person_match.score,
                                    source: Source::People,
                                    metadata: Some(json!({
                                        "person_id": person_match.person.id,
                                        "person": person_match.person.name,
                                    })),
                                });
                            }
                        }
                    }
                }

                results.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.photo_id.cmp(&b.photo_id))
                });
                results.truncate(limit);
                Ok(StrategyOutput { results, confidence })
            }),
        }
    }

    pub fn parse_query(&self, text: &str) -> SearchIntent {
        self.parser.parse(text)
    }

    /// Nearest neighbours of an already indexed photo.
    pub fn find_similar(&self, photo_id: u64, top_k: usize) -> anyhow::Result<Vec<SearchHit>> {
        Ok(self.semantic.find_similar_to(photo_id, top_k)?)
    }

    /// Queue one photo for embedding generation. `path` defaults to the
    /// stored photo path.
    pub fn enqueue_vector_generation(
        &self,
        photo_id: u64,
        path: Option<String>,
        priority: Priority,
    ) -> anyhow::Result<bool> {
        let path = match path {
            Some(path) => path,
            None => self
                .photos
                .get(photo_id)?
                .ok_or_else(|| anyhow!("Photo with id {photo_id} not found"))?
                .path,
        };
        Ok(self.pipeline.enqueue(photo_id, path, priority))
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.pipeline.stats()
    }

    /// Rebuild the queue from the stores; see [`VectorPipeline::recover`].
    pub fn recover_queue(&self) -> anyhow::Result<usize> {
        self.pipeline.recover()
    }

    /// Blocks until the queue drains; see [`VectorPipeline::process`].
    pub fn process_queue(&self) -> QueueStats {
        self.pipeline.process()
    }

    pub fn pipeline(&self) -> Arc<VectorPipeline> {
        self.pipeline.clone()
    }

    pub fn auto_match_faces(&self, options: AutoMatchOptions) -> Result<AutoMatchOutcome, FaceError> {
        self.clusterer.auto_match(options)
    }

    pub fn cluster_faces(&self) -> Result<Vec<FaceCluster>, FaceError> {
        self.clusterer.cluster_unassigned()
    }

    pub fn assign_face_to_person(
        &self,
        face_id: u64,
        person_id: u64,
    ) -> Result<FaceDescriptor, FaceError> {
        self.clusterer.assign_to_person(face_id, person_id)
    }

    pub fn unmatch_face(&self, face_id: u64) -> Result<FaceDescriptor, FaceError> {
        self.clusterer.unmatch_face(face_id)
    }

    /// Retrain the vector index clusters and persist the result.
    pub fn rebuild_index(&self) -> anyhow::Result<IndexStats> {
        let stats = self.semantic.rebuild_index()?;
        self.semantic.save_index()?;
        Ok(stats)
    }

    pub fn index_stats(&self) -> anyhow::Result<IndexStats> {
        Ok(self.semantic.stats()?)
    }

    pub fn add_photo(&self, create: PhotoCreate) -> anyhow::Result<Photo> {
        let photo = self.photos.create(create)?;
        self.keyword.write().unwrap().add_photo(&photo);
        Ok(photo)
    }

    pub fn update_photo(&self, id: u64, update: PhotoUpdate) -> anyhow::Result<Photo> {
        let photo = self.photos.update(id, update)?;
        // Reindex text; the embedding goes stale and is picked up by the
        // next pipeline recovery via its content hash.
        self.keyword.write().unwrap().add_photo(&photo);
        Ok(photo)
    }

    pub fn remove_photo(&self, id: u64) -> anyhow::Result<()> {
        self.photos.delete(id)?;
        self.keyword.write().unwrap().remove_photo(id);
        if self.semantic.is_initialized() {
            self.semantic.remove_embedding(id)?;
        }
        Ok(())
    }

    pub fn photos(&self) -> Arc<dyn PhotoStore> {
        self.photos.clone()
    }

    pub fn persons(&self) -> Arc<dyn PersonStore> {
        self.persons.clone()
    }

    pub fn people(&self) -> Arc<PersonLookup> {
        self.people.clone()
    }
}
