//! Embedding model wrapper for fastembed.
//!
//! Provides a high-level interface for generating embeddings:
//! - `EmbeddingModel`: a loaded fastembed model
//! - `LazyEmbedder`: shared handle that loads the model on first use
//! - `Embedder`: the seam the pipeline and tagger depend on

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fastembed::{InitOptions, TextEmbedding};

use crate::semantic::preprocess::prepare_for_embedding;

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Cannot embed empty text")]
    EmptyText,

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Anything that turns text into a dense vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Known vector length, if the model has been loaded.
    fn dimensions(&self) -> Option<usize>;

    fn model_name(&self) -> &str;
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        // Get model dimensions by embedding a test string
        let dimensions = Self::detect_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Generate an embedding for a single text.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

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

    /// Parse model name string to fastembed enum.
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
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported 384-dim models: all-MiniLM-L6-v2, bge-small-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    /// Embed a sample text to learn the output dimensions.
    fn detect_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

/// Process-wide embedding handle.
///
/// The model loads on the first `embed` call. Loading happens while the
/// slot mutex is held, so concurrent first callers wait for one load
/// instead of racing; everyone afterwards clones the cached `Arc`.
pub struct LazyEmbedder {
    model_name: String,
    cache_dir: PathBuf,
    max_input_chars: usize,
    /// Mutex<Option<_>> instead of OnceLock because get_or_try_init is unstable.
    slot: Mutex<Option<Arc<EmbeddingModel>>>,
}

impl LazyEmbedder {
    pub fn new(model_name: &str, cache_dir: PathBuf, max_input_chars: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            cache_dir,
            max_input_chars,
            slot: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.slot
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Get the loaded model, loading it if this is the first call.
    pub fn model(&self) -> Result<Arc<EmbeddingModel>, EmbeddingError> {
        let mut guard = self.slot.lock().map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to acquire model slot: {}", e))
        })?;

        if let Some(model) = guard.as_ref() {
            return Ok(model.clone());
        }

        log::info!("Loading embedding model '{}'", self.model_name);
        let model = Arc::new(EmbeddingModel::new(&self.model_name, self.cache_dir.clone())?);
        log::info!(
            "Embedding model '{}' ready ({} dimensions)",
            model.name(),
            model.dimensions()
        );
        *guard = Some(model.clone());

        Ok(model)
    }
}

impl Embedder for LazyEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = prepare_for_embedding(text, self.max_input_chars)
            .ok_or(EmbeddingError::EmptyText)?;
        self.model()?.embed(&input)
    }

    fn dimensions(&self) -> Option<usize> {
        self.slot
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|m| m.dimensions()))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// SHA256 of a model name, stamped into the index file so vectors from
/// different models are never mixed.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_model_creation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = EmbeddingModel::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf());
        assert!(model.is_ok());

        let model = model.unwrap();
        assert_eq!(model.name(), "all-MiniLM-L6-v2");
        assert_eq!(model.dimensions(), 384);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_lazy_embedder_loads_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(LazyEmbedder::new(
            "all-MiniLM-L6-v2",
            temp_dir.path().to_path_buf(),
            2048,
        ));
        assert!(!embedder.is_loaded());
        assert_eq!(embedder.dimensions(), None);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let embedder = embedder.clone();
                std::thread::spawn(move || embedder.embed(&format!("thread {i}")).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().len(), 384);
        }

        let first = embedder.model().unwrap();
        let second = embedder.model().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(embedder.dimensions(), Some(384));
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new("nonexistent-model", temp_dir.path().to_path_buf());
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_empty_text_rejected_before_loading() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = LazyEmbedder::new("all-MiniLM-L6-v2", temp_dir.path().to_path_buf(), 2048);

        assert!(matches!(embedder.embed("  \n\t "), Err(EmbeddingError::EmptyText)));
        assert!(!embedder.is_loaded());
    }

    #[test]
    fn test_lazy_embedder_invalid_model_stays_unloaded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = LazyEmbedder::new("nonexistent-model", temp_dir.path().to_path_buf(), 2048);

        assert!(matches!(
            embedder.embed("hello"),
            Err(EmbeddingError::InvalidModel(_))
        ));
        assert!(!embedder.is_loaded());
        assert_eq!(embedder.model_name(), "nonexistent-model");
    }

    #[test]
    fn test_model_id_hash_consistency() {
        assert_eq!(
            model_id_hash("all-MiniLM-L6-v2"),
            model_id_hash("all-MiniLM-L6-v2")
        );
        assert_ne!(
            model_id_hash("all-MiniLM-L6-v2"),
            model_id_hash("bge-small-en-v1.5")
        );
    }
}
