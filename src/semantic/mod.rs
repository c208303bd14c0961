//! Embedding, tagging and vector search for indexed documents.
//!
//! # Architecture
//!
//! - `embeddings`: Wraps fastembed; `LazyEmbedder` loads the model on first use
//! - `preprocess`: Text cleanup before embedding
//! - `tagger`: Zero-shot labels scored against the embedding model
//! - `index`: Exact flat index over squared L2 distance
//! - `mapping`: Index position to document id
//! - `storage`: Binary index file plus JSON mapping, written as a pair
//! - `service`: Locked, lazily loaded `VectorIndex` shared by all callers

pub mod embeddings;
pub mod index;
pub mod mapping;
mod preprocess;
pub mod service;
pub mod storage;
pub mod tagger;

pub use embeddings::{Embedder, EmbeddingError, LazyEmbedder};
pub use index::IndexError;
pub use service::{IndexStatus, SearchHit, VectorIndex, VectorIndexError};
pub use tagger::{Tagger, TaggingError, ZeroShotTagger};

/// Default embedding model name (384 dimensions)
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
