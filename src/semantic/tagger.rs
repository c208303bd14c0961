//! Zero-shot topic tagging on top of the embedding model.
//!
//! Each candidate label is turned into a hypothesis sentence and embedded
//! once. A text is scored against every label by cosine similarity, the
//! similarities go through a temperature-scaled softmax, and labels whose
//! share reaches the threshold are returned.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::cosine_similarity;

const HYPOTHESIS_TEMPLATE: &str = "This text is about {}.";

#[derive(Debug, thiserror::Error)]
pub enum TaggingError {
    #[error("Cannot tag empty text")]
    EmptyText,

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub trait Tagger: Send + Sync {
    /// Labels from `labels` scoring at least `threshold`.
    fn classify(
        &self,
        text: &str,
        labels: &[String],
        threshold: f32,
    ) -> Result<BTreeSet<String>, TaggingError>;

    /// Same as `classify` for a text that is already embedded with the
    /// tagger's model.
    fn classify_embedding(
        &self,
        embedding: &[f32],
        labels: &[String],
        threshold: f32,
    ) -> Result<BTreeSet<String>, TaggingError>;
}

pub struct ZeroShotTagger {
    embedder: Arc<dyn Embedder>,
    temperature: f32,
    /// label -> hypothesis embedding
    label_cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl ZeroShotTagger {
    pub fn new(embedder: Arc<dyn Embedder>, temperature: f32) -> Self {
        Self {
            embedder,
            temperature,
            label_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Score every label; scores sum to 1 across `labels`.
    pub fn scores(&self, text: &str, labels: &[String]) -> Result<Vec<(String, f32)>, TaggingError> {
        if text.trim().is_empty() {
            return Err(TaggingError::EmptyText);
        }
        if labels.is_empty() {
            return Ok(vec![]);
        }

        let text_embedding = self.embedder.embed(text)?;
        self.scores_for_embedding(&text_embedding, labels)
    }

    /// Score every label against an existing text embedding.
    pub fn scores_for_embedding(
        &self,
        text_embedding: &[f32],
        labels: &[String],
    ) -> Result<Vec<(String, f32)>, TaggingError> {
        if labels.is_empty() {
            return Ok(vec![]);
        }
        let label_embeddings = self.label_embeddings(labels)?;

        let similarities: Vec<f32> = label_embeddings
            .iter()
            .map(|label| cosine_similarity(text_embedding, label))
            .collect();

        let probabilities = softmax(&similarities, self.temperature);

        Ok(labels.iter().cloned().zip(probabilities).collect())
    }

    fn label_embeddings(&self, labels: &[String]) -> Result<Vec<Vec<f32>>, TaggingError> {
        let mut cache = self
            .label_cache
            .lock()
            .map_err(|e| TaggingError::Internal(format!("Lock poisoned: {}", e)))?;

        let mut embeddings = Vec::with_capacity(labels.len());
        for label in labels {
            if let Some(embedding) = cache.get(label) {
                embeddings.push(embedding.clone());
                continue;
            }
            let hypothesis = HYPOTHESIS_TEMPLATE.replace("{}", label);
            let embedding = self.embedder.embed(&hypothesis)?;
            cache.insert(label.clone(), embedding.clone());
            embeddings.push(embedding);
        }

        Ok(embeddings)
    }
}

impl Tagger for ZeroShotTagger {
    fn classify(
        &self,
        text: &str,
        labels: &[String],
        threshold: f32,
    ) -> Result<BTreeSet<String>, TaggingError> {
        Ok(above_threshold(self.scores(text, labels)?, threshold))
    }

    fn classify_embedding(
        &self,
        embedding: &[f32],
        labels: &[String],
        threshold: f32,
    ) -> Result<BTreeSet<String>, TaggingError> {
        Ok(above_threshold(
            self.scores_for_embedding(embedding, labels)?,
            threshold,
        ))
    }
}

fn above_threshold(scores: Vec<(String, f32)>, threshold: f32) -> BTreeSet<String> {
    scores
        .into_iter()
        .filter(|(_, score)| *score >= threshold)
        .map(|(label, _)| label)
        .collect()
}

fn softmax(values: &[f32], temperature: f32) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values
        .iter()
        .map(|v| ((v - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
