//! The high-level semantic search entry point.
//!
//! Owns the embedding provider, the vector index and its on-disk
//! storage, loading all three lazily on first use. Searches run
//! concurrently; index mutations take the write lock.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{EmbeddingConfig, IndexConfig};
use crate::semantic::index::{
    IndexError, IndexStats, SearchHit, VectorIndex, VectorSearchOptions,
};
use crate::semantic::provider::{
    model_id_hash, EmbeddingError, EmbeddingProvider, FastembedProvider,
};
use crate::semantic::storage::{VectorStorage, VectorStorageError};
use crate::semantic::DEFAULT_THRESHOLD;

#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("embedding: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index: {0}")]
    Index(#[from] IndexError),

    #[error("vector storage: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("no embedding stored for photo {0}")]
    MissingEmbedding(u64),

    #[error("semantic service is not initialized")]
    NotInitialized,

    #[error("internal: {0}")]
    Internal(String),
}

/// Everything that only exists after first use.
struct SemanticState {
    provider: Arc<dyn EmbeddingProvider>,
    index: VectorIndex,
    storage: VectorStorage,
}

/// Photo-level semantic search over the vector index.
///
/// Construction is cheap; the model and index load on the first call
/// that needs them. Reads share the lock, mutations serialize.
pub struct SemanticService {
    embedding: EmbeddingConfig,
    layout: IndexConfig,
    base_path: PathBuf,
    /// Injected provider for tests and alternative backends; `None` means
    /// fastembed is constructed on first use.
    override_provider: Option<Arc<dyn EmbeddingProvider>>,
    /// RwLock<Option<_>> rather than OnceLock: initialization is
    /// fallible and get_or_try_init is not stable.
    state: RwLock<Option<SemanticState>>,
}

impl SemanticService {
    /// A service that will build a fastembed provider on first use.
    ///
    /// `base_path` holds the data files: vectors.bin and the models/
    /// cache directory.
    pub fn new(embedding: EmbeddingConfig, layout: IndexConfig, base_path: PathBuf) -> Self {
        Self {
            embedding,
            layout,
            base_path,
            override_provider: None,
            state: RwLock::new(None),
        }
    }

    /// Create a service backed by the given provider instead of fastembed.
    pub fn with_provider(
        embedding: EmbeddingConfig,
        layout: IndexConfig,
        base_path: PathBuf,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            embedding,
            layout,
            base_path,
            override_provider: Some(provider),
            state: RwLock::new(None),
        }
    }

    /// Embed a query or caption text.
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>, SemanticError> {
        self.ensure_initialized()?;
        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;
        Ok(state.provider.embed_text(text)?)
    }

    /// Embed the pixel content of an image file.
    pub fn embed_image(&self, path: &std::path::Path) -> Result<Vec<f32>, SemanticError> {
        self.ensure_initialized()?;
        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;
        Ok(state.provider.embed_image(path)?)
    }

    /// Photo ids most similar to a text query, best first. `threshold`
    /// falls back to the module default when not given.
    pub fn search(
        &self,
        query: &str,
        threshold: Option<f32>,
        limit: usize,
    ) -> Result<Vec<u64>, SemanticError> {
        let results = self.search_with_scores(query, threshold, limit)?;
        Ok(results.into_iter().map(|r| r.photo_id).collect())
    }

    /// Like `search`, keeping the similarity scores.
    pub fn search_with_scores(
        &self,
        query: &str,
        threshold: Option<f32>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, SemanticError> {
        self.ensure_initialized()?;

        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;

        let query_embedding = state.provider.embed_text(query)?;

        let options = VectorSearchOptions {
            limit,
            threshold: threshold.unwrap_or(DEFAULT_THRESHOLD),
            num_probes: None,
        };
        Ok(state.index.search(&query_embedding, &options)?)
    }

    /// Find photos most similar to a photo already in the index.
    ///
    /// The photo itself is excluded from the results.
    pub fn find_similar_to(
        &self,
        photo_id: u64,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, SemanticError> {
        self.ensure_initialized()?;

        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;

        let entry = state
            .index
            .get(photo_id)
            .ok_or(SemanticError::MissingEmbedding(photo_id))?;
        let query = entry.embedding.clone();

        let options = VectorSearchOptions {
            limit: top_k + 1,
            threshold: 0.0,
            num_probes: None,
        };
        let mut results = state.index.search(&query, &options)?;
        results.retain(|hit| hit.photo_id != photo_id);
        results.truncate(top_k);
        Ok(results)
    }

    /// Insert or update a photo embedding in the index.
    pub fn insert_embedding(
        &self,
        photo_id: u64,
        content_hash: u64,
        embedding: Vec<f32>,
    ) -> Result<(), SemanticError> {
        self.ensure_initialized()?;
        let mut guard = self.write_state()?;
        let state = guard.as_mut().ok_or(SemanticError::NotInitialized)?;
        state.index.insert(photo_id, content_hash, embedding)?;
        Ok(())
    }

    /// Drop a photo embedding from the index.
    ///
    /// Returns true if an embedding was present.
    pub fn remove_embedding(&self, photo_id: u64) -> Result<bool, SemanticError> {
        self.ensure_initialized()?;
        let mut guard = self.write_state()?;
        let state = guard.as_mut().ok_or(SemanticError::NotInitialized)?;
        Ok(state.index.remove(photo_id).is_some())
    }

    /// Check whether a photo has an indexed embedding.
    ///
    /// Returns false if not yet initialized.
    pub fn contains(&self, photo_id: u64) -> bool {
        self.state
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.index.contains(photo_id)))
            .unwrap_or(false)
    }

    /// Retrain the index cluster layout.
    pub fn rebuild_index(&self) -> Result<IndexStats, SemanticError> {
        self.ensure_initialized()?;
        let mut guard = self.write_state()?;
        let state = guard.as_mut().ok_or(SemanticError::NotInitialized)?;
        state.index.rebuild();
        Ok(state.index.stats())
    }

    /// Current index shape.
    pub fn stats(&self) -> Result<IndexStats, SemanticError> {
        self.ensure_initialized()?;
        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;
        Ok(state.index.stats())
    }

    /// Number of indexed entries, 0 before initialization.
    pub fn indexed_count(&self) -> usize {
        self.state
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.index.len()))
            .unwrap_or(0)
    }

    /// Storage identifier of the active embedding model.
    pub fn model_id(&self) -> Result<[u8; 32], SemanticError> {
        self.ensure_initialized()?;
        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;
        Ok(model_id_hash(state.provider.model_name()))
    }

    /// Embedding dimensions of the active model.
    pub fn dimensions(&self) -> Result<usize, SemanticError> {
        self.ensure_initialized()?;
        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;
        Ok(state.provider.dimensions())
    }

    pub fn is_initialized(&self) -> bool {
        self.state
            .read()
            .ok()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Load the model and index now instead of on first search.
    pub fn initialize(&self) -> Result<(), SemanticError> {
        self.ensure_initialized()
    }

    /// Run `f` with exclusive access to the index and a provider
    /// reference. Maintenance only; keeping storage in sync is on the
    /// caller.
    pub fn with_index_mut<F, R>(&self, f: F) -> Result<R, SemanticError>
    where
        F: FnOnce(&mut VectorIndex, &dyn EmbeddingProvider) -> R,
    {
        self.ensure_initialized()?;

        let mut guard = self.write_state()?;
        let state = guard.as_mut().ok_or(SemanticError::NotInitialized)?;

        let index = &mut state.index;
        let provider = state.provider.as_ref();
        Ok(f(index, provider))
    }

    /// Flush the index to vectors.bin.
    pub fn save_index(&self) -> Result<(), SemanticError> {
        self.ensure_initialized()?;

        let guard = self.read_state()?;
        let state = guard.as_ref().ok_or(SemanticError::NotInitialized)?;

        let model_id = model_id_hash(state.provider.model_name());
        state.storage.save(&state.index, &model_id)?;

        Ok(())
    }

    fn read_state(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, Option<SemanticState>>, SemanticError> {
        self.state
            .read()
            .map_err(|e| SemanticError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn write_state(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, Option<SemanticState>>, SemanticError> {
        self.state
            .write()
            .map_err(|e| SemanticError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn ensure_initialized(&self) -> Result<(), SemanticError> {
        {
            let guard = self.read_state()?;
            if guard.is_some() {
                return Ok(());
            }
        }

        let mut guard = self.write_state()?;
        if guard.is_none() {
            *guard = Some(self.do_init()?);
        }

        Ok(())
    }

    fn do_init(&self) -> Result<SemanticState, SemanticError> {
        log::info!("Bringing up semantic search, model '{}'", self.embedding.model);

        let provider: Arc<dyn EmbeddingProvider> = match &self.override_provider {
            Some(provider) => Arc::clone(provider),
            None => {
                let timeout = Duration::from_secs(self.embedding.download_timeout_secs);
                let image_model = match self.embedding.image_model.as_str() {
                    "" => None,
                    name => Some(name),
                };
                Arc::new(FastembedProvider::new(
                    &self.embedding.model,
                    image_model,
                    self.base_path.clone(),
                    Some(timeout),
                )?)
            }
        };

        let model_id = model_id_hash(provider.model_name());
        let dimensions = provider.dimensions();

        let storage = VectorStorage::new(self.base_path.join("vectors.bin"));

        let mut index = self.fresh_index(dimensions);
        if storage.exists() {
            match storage.load_into(&mut index, &model_id) {
                Ok(count) => {
                    log::info!("Loaded {count} vectors from storage");
                }
                Err(VectorStorageError::ModelMismatch) => {
                    log::warn!("Model changed, creating fresh index");
                    index = self.fresh_index(dimensions);
                }
                Err(VectorStorageError::VersionMismatch(file_ver, _)) => {
                    log::warn!("Storage version {file_ver} unsupported, creating fresh index");
                    index = self.fresh_index(dimensions);
                }
                Err(VectorStorageError::Io(e)) => {
                    log::error!("Failed to read vector storage: {e}");
                    return Err(VectorStorageError::Io(e).into());
                }
                // Corrupted or incompatible files are regenerated by the
                // embedding pipeline; refusing to start would wedge it.
                Err(e) => {
                    log::warn!("Stored vectors unusable ({e}), creating fresh index");
                    index = self.fresh_index(dimensions);
                }
            }
        } else {
            log::info!("No existing index, starting fresh");
        }

        if index.len() >= self.layout.size_threshold {
            index.rebuild();
        }

        Ok(SemanticState {
            provider,
            index,
            storage,
        })
    }

    fn fresh_index(&self, dimensions: usize) -> VectorIndex {
        VectorIndex::with_layout(
            dimensions,
            self.layout.size_threshold,
            self.layout.clusters,
            self.layout.num_probes,
        )
    }
}
