//! Semantic search infrastructure for photo embeddings.
//!
//! This module provides local semantic search capabilities using fastembed-rs
//! for generating embeddings and an in-memory vector index with an optional
//! clustered (IVF-style) layout for sub-linear search.
//!
//! # Architecture
//!
//! - `provider`: Embedding generation behind the `EmbeddingProvider` trait
//! - `index`: Vector index with exhaustive and clustered search modes
//! - `storage`: Binary file I/O for vectors.bin persistence
//! - `preprocess`: Caption preprocessing for embedding input
//! - `service`: High-level semantic search service

pub mod index;
mod preprocess;
pub mod provider;
mod service;
pub mod storage;

pub use index::{IndexStats, SearchHit, VectorIndex, VectorSearchOptions};
pub use preprocess::{caption_hash, preprocess_caption};
pub use provider::{model_id_hash, EmbeddingError, EmbeddingProvider, FastembedProvider};
pub use service::{SemanticError, SemanticService};
pub use storage::{VectorStorage, VectorStorageError};

/// Default similarity threshold for semantic search
pub const DEFAULT_THRESHOLD: f32 = 0.35;
