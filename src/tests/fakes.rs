//! In-memory stand-ins for the extractor and the models.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::document::SourceReference;
use crate::extract::{ExtractionError, TextExtractor};
use crate::semantic::embeddings::model_id_hash;
use crate::semantic::storage::IndexStorage;
use crate::semantic::{Embedder, EmbeddingError, Tagger, TaggingError, VectorIndex};

pub const DIMS: usize = 8;

/// Returns canned text per source; unknown sources fail like a 404.
#[derive(Default)]
pub struct FakeExtractor {
    texts: HashMap<String, String>,
    pub calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn with(mut self, source: &SourceReference, text: &str) -> Self {
        self.texts.insert(source.to_string(), text.to_string());
        self
    }
}

impl TextExtractor for FakeExtractor {
    fn extract(&self, source: &SourceReference) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts
            .get(&source.to_string())
            .cloned()
            .ok_or_else(|| ExtractionError::Status(reqwest::StatusCode::NOT_FOUND))
    }
}

/// Bag of words hashed into `DIMS` buckets. Same text, same vector.
#[derive(Default)]
pub struct HashEmbedder {
    /// Texts containing this marker fail to embed.
    pub fail_on: Option<&'static str>,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; DIMS];
        for word in text.split_whitespace() {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            v[bucket % DIMS] += 1.0;
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        if let Some(marker) = self.fail_on {
            if text.contains(marker) {
                return Err(EmbeddingError::EmbeddingFailed("model crashed".into()));
            }
        }
        Ok(Self::vector(text))
    }

    fn dimensions(&self) -> Option<usize> {
        Some(DIMS)
    }

    fn model_name(&self) -> &str {
        "hash"
    }
}

/// Always answers with the same labels.
pub struct FixedTagger {
    labels: Vec<&'static str>,
    fail: bool,
    /// Classifications from an embedding.
    pub calls: AtomicUsize,
    /// Classifications from raw text.
    pub text_calls: AtomicUsize,
}

impl FixedTagger {
    pub fn new(labels: &[&'static str]) -> Self {
        Self {
            labels: labels.to_vec(),
            fail: false,
            calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            labels: vec![],
            fail: true,
            calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
        }
    }
}

impl FixedTagger {
    fn answer(&self) -> Result<BTreeSet<String>, TaggingError> {
        if self.fail {
            return Err(TaggingError::Internal("classifier unavailable".into()));
        }
        Ok(self.labels.iter().map(|l| l.to_string()).collect())
    }
}

impl Tagger for FixedTagger {
    fn classify(
        &self,
        _text: &str,
        _labels: &[String],
        _threshold: f32,
    ) -> Result<BTreeSet<String>, TaggingError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.answer()
    }

    fn classify_embedding(
        &self,
        _embedding: &[f32],
        _labels: &[String],
        _threshold: f32,
    ) -> Result<BTreeSet<String>, TaggingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer()
    }
}

pub fn vector_index(dir: &Path) -> VectorIndex {
    VectorIndex::new(
        IndexStorage::new(
            dir.join("vectors.index"),
            dir.join("vector_map.json"),
            model_id_hash("hash"),
        ),
        dir.to_path_buf(),
        false,
    )
}
