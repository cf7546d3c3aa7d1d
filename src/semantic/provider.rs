//! Embedding providers.
//!
//! The engine talks to embedding models through the [`EmbeddingProvider`]
//! trait so tests and alternative backends can swap in. The default
//! implementation wraps fastembed: models download lazily into a cache
//! directory, texts embed in batches, and an optional image encoder
//! (CLIP family) handles caption-less photos. Without an encoder, image
//! embedding reports the model as unavailable.

use fastembed::{
    ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding,
};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// How long a first-use model download may take before giving up
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Could not decode input: {0}")]
    DecodeError(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Generates embedding vectors from photo content.
///
/// Implementations must be shareable across worker threads.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text, such as a search query or a photo caption.
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts in one call. Defaults to embedding one by one.
    fn embed_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed_text(text)).collect()
    }

    /// Embed the pixel content of an image file.
    ///
    /// Fails with [`EmbeddingError::ModelUnavailable`] when the provider
    /// has no image encoder, or [`EmbeddingError::DecodeError`] when the
    /// file cannot be decoded.
    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError>;

    /// Embedding dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Model name, used to key stored vectors.
    fn model_name(&self) -> &str;
}

/// Compute SHA256 hash of a model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// fastembed-backed provider: a text model plus an optional image
/// encoder sharing its vector space. Both sit behind a Mutex since
/// fastembed embeds through `&mut self`.
pub struct FastembedProvider {
    model: Mutex<TextEmbedding>,
    image: Option<Mutex<ImageEmbedding>>,
    model_name: String,
    dimensions: usize,
}

impl FastembedProvider {
    /// Construct a provider for `model_name` (e.g. "all-MiniLM-L6-v2"),
    /// optionally paired with an image encoder that must produce the
    /// same dimensions (use "clip-vit-b-32" for both names).
    ///
    /// Model files land in the `models/` subdirectory of `cache_dir`;
    /// anything not cached yet downloads now, bounded by
    /// `download_timeout`.
    pub fn new(
        model_name: &str,
        image_model_name: Option<&str>,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        // Parse names up front so a bad configuration fails before any download
        let model_enum = Self::parse_model_name(model_name)?;
        let image_model = match image_model_name {
            Some(name) => {
                let (image_enum, image_dims) = Self::parse_image_model(name)?;
                Some((name.to_string(), image_enum, image_dims))
            }
            None => None,
        };
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        // First run downloads model files; bound construction by the timeout
        let text_name = model_name.to_string();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            // Receiver may be gone after a timeout
            let _ = tx.send(Self::build(model_enum, text_name, image_model, models_dir));
        });

        match rx.recv_timeout(timeout) {
            Ok(built) => built,
            Err(RecvTimeoutError::Timeout) => {
                Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EmbeddingError::InitFailed(
                "model construction thread exited without a result".to_string(),
            )),
        }
    }

    /// Build the text model and optional image encoder. Runs on a worker
    /// thread so [`FastembedProvider::new`] can enforce the download timeout.
    fn build(
        model_enum: fastembed::EmbeddingModel,
        model_name: String,
        image_model: Option<(String, ImageEmbeddingModel, usize)>,
        models_dir: PathBuf,
    ) -> Result<Self, EmbeddingError> {
        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir.clone())
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;

        let (image, model_name) = match image_model {
            Some((image_name, image_enum, image_dims)) => {
                if image_dims != dimensions {
                    return Err(EmbeddingError::InitFailed(format!(
                        "text model {model_name} ({dimensions} dims) and image model {image_name} ({image_dims} dims) do not share an embedding space"
                    )));
                }
                let image_options = ImageInitOptions::new(image_enum)
                    .with_cache_dir(models_dir)
                    .with_show_download_progress(true);
                let image = ImageEmbedding::try_new(image_options)
                    .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
                // Stored vectors are keyed on the pair; changing either
                // model invalidates them
                (Some(Mutex::new(image)), format!("{model_name}+{image_name}"))
            }
            None => (None, model_name),
        };

        Ok(Self {
            model: Mutex::new(model),
            image,
            model_name,
            dimensions,
        })
    }

    /// Map a configured text model name onto fastembed's enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "bge-large-en-v1.5-q" | "bgelargeenv15q" => {
                Ok(fastembed::EmbeddingModel::BGELargeENV15Q)
            }
            // CLIP text tower, for pairing with the image encoder
            "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::EmbeddingModel::ClipVitB32),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized), clip-vit-b-32",
                name
            ))),
        }
    }

    /// Parse image model name to fastembed enum plus its dimensions.
    fn parse_image_model(name: &str) -> Result<(ImageEmbeddingModel, usize), EmbeddingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok((ImageEmbeddingModel::ClipVitB32, 512)),
            "unicom-vit-b-32" | "unicomvitb32" => Ok((ImageEmbeddingModel::UnicomVitB32, 512)),
            "unicom-vit-b-16" | "unicomvitb16" => Ok((ImageEmbeddingModel::UnicomVitB16, 768)),
            "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
                Ok((ImageEmbeddingModel::NomicEmbedVisionV15, 768))
            }
            "resnet50" => Ok((ImageEmbeddingModel::Resnet50, 2048)),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown image model: {}. Supported image models: clip-vit-b-32, unicom-vit-b-32, unicom-vit-b-16, nomic-embed-vision-v1.5, resnet50",
                name
            ))),
        }
    }

    /// Learn the model's dimensions by embedding a throwaway string.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let probe = model
            .embed(vec!["probe"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl EmbeddingProvider for FastembedProvider {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_text_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        let Some(image) = &self.image else {
            return Err(EmbeddingError::ModelUnavailable(format!(
                "{} is a text-only model; no image encoder configured",
                self.model_name
            )));
        };

        if !path.is_file() {
            return Err(EmbeddingError::DecodeError(format!(
                "{} is not a readable file",
                path.display()
            )));
        }

        let mut model = image.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![path.to_string_lossy().into_owned()], None)
            .map_err(|e| EmbeddingError::DecodeError(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
