//! Per-document indexing: gather text, embed, tag, add to the vector index.
//!
//! Every stage reports a `StageOutcome`. A failing stage degrades the
//! document and the rest carry on: the gathered text, embedding and tags
//! are returned even when the index add fails. An index that has to be
//! rebuilt is flagged in the `ProcessReport`. Only failures of the
//! machine itself (disk, lock file) abort with `PipelineError`.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::{Config, TaggingConfig};
use crate::document::{Document, SourceReference};
use crate::extract::{ExtractionError, Extractor, TextExtractor};
use crate::semantic::{
    Embedder, EmbeddingError, IndexError, IndexStatus, LazyEmbedder, SearchHit, Tagger,
    VectorIndex, VectorIndexError, ZeroShotTagger,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    TextGathered,
    Embedded,
    Tagged,
    Indexed,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum StageOutcome {
    Completed,
    Skipped(String),
    Failed(String),
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: SourceReference,
    pub reason: String,
}

/// What happened to one document.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub document_id: u64,
    /// Last stage that completed.
    pub reached: Stage,
    pub stages: Vec<(Stage, StageOutcome)>,
    pub source_failures: Vec<SourceFailure>,
    /// Index position, when the document was added.
    pub position: Option<u64>,
    /// The index files are unusable until `rebuild` runs.
    pub needs_rebuild: bool,
}

impl ProcessReport {
    fn new(document_id: u64) -> Self {
        Self {
            document_id,
            reached: Stage::Created,
            stages: Vec::new(),
            source_failures: Vec::new(),
            position: None,
            needs_rebuild: false,
        }
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| outcome)
    }

    fn record(&mut self, stage: Stage, outcome: StageOutcome) {
        match &outcome {
            StageOutcome::Completed => self.reached = stage,
            StageOutcome::Skipped(reason) => {
                log::debug!("document {}: {:?} skipped: {}", self.document_id, stage, reason)
            }
            StageOutcome::Failed(reason) => {
                log::warn!("document {}: {:?} failed: {}", self.document_id, stage, reason)
            }
        }
        self.stages.push((stage, outcome));
    }

    fn skip_rest(&mut self, stages: &[Stage], reason: &str) {
        for stage in stages {
            self.record(*stage, StageOutcome::Skipped(reason.to_string()));
        }
    }
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub document: Document,
    pub report: ProcessReport,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Index error: {0}")]
    Index(#[from] VectorIndexError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Extractor setup failed: {0}")]
    Setup(#[from] ExtractionError),
}

pub struct IndexingPipeline {
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    /// None when tagging is disabled
    tagger: Option<Arc<dyn Tagger>>,
    labels: Vec<String>,
    threshold: f32,
    index: Arc<VectorIndex>,
}

impl IndexingPipeline {
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        tagger: Option<Arc<dyn Tagger>>,
        tagging: &TaggingConfig,
        index: Arc<VectorIndex>,
    ) -> Self {
        Self {
            extractor,
            embedder,
            tagger: tagger.filter(|_| tagging.enabled),
            labels: tagging.labels.clone(),
            threshold: tagging.threshold,
            index,
        }
    }

    /// Wire up the real extractor, model handle and index files.
    ///
    /// Nothing heavy happens here: the model loads on the first embed and
    /// the index on the first search or add.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let extractor = Arc::new(Extractor::new(&config.extraction)?);
        let embedder: Arc<dyn Embedder> = Arc::new(LazyEmbedder::new(
            &config.embedding.model,
            config.base_path().to_path_buf(),
            config.embedding.max_input_chars,
        ));
        let tagger: Option<Arc<dyn Tagger>> = if config.tagging.enabled {
            Some(Arc::new(ZeroShotTagger::new(
                embedder.clone(),
                config.tagging.temperature,
            )))
        } else {
            None
        };
        let index = Arc::new(VectorIndex::from_config(config));

        Ok(Self::new(extractor, embedder, tagger, &config.tagging, index))
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Run one document through every stage.
    ///
    /// Returns the updated document for the caller to persist. `Err` means
    /// the index could not be reached at all (I/O or lock failure).
    pub fn process(&self, mut document: Document) -> Result<ProcessOutcome, PipelineError> {
        let mut report = ProcessReport::new(document.id);

        let text = self.gather_text(&document.sources, &mut report.source_failures);
        if text.is_empty() {
            document.text = None;
            document.embedding = None;
            report.record(
                Stage::TextGathered,
                StageOutcome::Skipped("no text extracted".into()),
            );
            report.skip_rest(&[Stage::Embedded, Stage::Tagged, Stage::Indexed], "no text");
            return Ok(ProcessOutcome { document, report });
        }
        report.record(Stage::TextGathered, StageOutcome::Completed);

        let embedding = match self.embedder.embed(&text) {
            Ok(embedding) => embedding,
            Err(e) => {
                document.text = Some(text);
                document.embedding = None;
                report.record(Stage::Embedded, StageOutcome::Failed(e.to_string()));
                report.skip_rest(&[Stage::Tagged, Stage::Indexed], "no embedding");
                return Ok(ProcessOutcome { document, report });
            }
        };
        report.record(Stage::Embedded, StageOutcome::Completed);

        let tagged = self.tag(&embedding, &mut document);
        report.record(Stage::Tagged, tagged);

        match self.index.add(document.id, &embedding) {
            Ok(position) => {
                report.position = Some(position);
                report.record(Stage::Indexed, StageOutcome::Completed);
                report.reached = Stage::Done;
            }
            Err(VectorIndexError::Index(IndexError::AlreadyIndexed(id))) => {
                report.record(
                    Stage::Indexed,
                    StageOutcome::Failed(format!("document {id} is already indexed")),
                );
            }
            Err(e) if e.is_catastrophic() => return Err(e.into()),
            Err(e) => {
                if e.needs_rebuild() {
                    log::error!(
                        "document {}: vector index needs a rebuild: {}",
                        document.id,
                        e
                    );
                    report.needs_rebuild = true;
                }
                report.record(Stage::Indexed, StageOutcome::Failed(e.to_string()));
            }
        }

        document.text = Some(text);
        document.embedding = Some(embedding);

        Ok(ProcessOutcome { document, report })
    }

    /// Ids of the documents nearest to `text`, nearest first.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<u64>, PipelineError> {
        Ok(self
            .query_with_distances(text, k)?
            .into_iter()
            .map(|hit| hit.document_id)
            .collect())
    }

    pub fn query_with_distances(
        &self,
        text: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>, PipelineError> {
        if text.trim().is_empty() {
            return Ok(vec![]);
        }
        let vector = self.embedder.embed(text)?;
        Ok(self.index.search_with_distances(&vector, k)?)
    }

    pub fn rebuild(&self, documents: Vec<Document>) -> Result<Vec<Document>, PipelineError> {
        self.rebuild_with_progress(documents, &|_| {})
    }

    /// Throw the index away and re-add every document.
    ///
    /// Stored text is reused; documents without text are extracted again.
    /// Embedding runs in parallel, `on_done` is called once per document as
    /// it finishes. Documents that still yield no embedding are returned
    /// unchanged and left out of the index. Tags are not recomputed.
    pub fn rebuild_with_progress(
        &self,
        documents: Vec<Document>,
        on_done: &(dyn Fn(&Document) + Sync),
    ) -> Result<Vec<Document>, PipelineError> {
        log::info!(
            "re-embedding {} documents with '{}'",
            documents.len(),
            self.embedder.model_name()
        );
        let documents: Vec<Document> = documents
            .into_par_iter()
            .map(|document| {
                let document = self.reembed(document);
                on_done(&document);
                document
            })
            .collect();

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(documents.len());
        for document in &documents {
            let Some(embedding) = &document.embedding else {
                continue;
            };
            if !seen.insert(document.id) {
                log::warn!("document {} listed twice, indexing it once", document.id);
                continue;
            }
            records.push((document.id, embedding.clone()));
        }

        let status = self.index.rebuild(&records)?;
        log::info!(
            "rebuilt index: {} of {} documents indexed",
            status.ntotal,
            documents.len()
        );

        Ok(documents)
    }

    pub fn status(&self) -> Result<IndexStatus, PipelineError> {
        Ok(self.index.status()?)
    }

    fn reembed(&self, mut document: Document) -> Document {
        let text = match document.text.take().filter(|t| !t.trim().is_empty()) {
            Some(text) => text,
            None => self.gather_text(&document.sources, &mut Vec::new()),
        };
        if text.is_empty() {
            document.embedding = None;
            return document;
        }

        match self.embedder.embed(&text) {
            Ok(embedding) => document.embedding = Some(embedding),
            Err(e) => {
                log::warn!("document {}: embedding failed: {}", document.id, e);
                document.embedding = None;
            }
        }
        document.text = Some(text);
        document
    }

    /// Extract every source; failures are recorded and skipped.
    fn gather_text(
        &self,
        sources: &[SourceReference],
        failures: &mut Vec<SourceFailure>,
    ) -> String {
        let mut chunks = Vec::with_capacity(sources.len());
        for source in sources {
            match self.extractor.extract(source) {
                Ok(text) => chunks.push(text),
                Err(e) => {
                    log::warn!("failed to extract {}: {}", source, e);
                    failures.push(SourceFailure {
                        source: source.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        chunks.join("\n").trim().to_string()
    }

    /// Union classifier labels into the document's tags.
    fn tag(&self, embedding: &[f32], document: &mut Document) -> StageOutcome {
        let Some(tagger) = &self.tagger else {
            return StageOutcome::Skipped("tagging disabled".into());
        };
        match tagger.classify_embedding(embedding, &self.labels, self.threshold) {
            Ok(labels) => {
                document.tags.extend(labels);
                StageOutcome::Completed
            }
            Err(e) => StageOutcome::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_tracks_last_completed_stage() {
        let mut report = ProcessReport::new(3);
        report.record(Stage::TextGathered, StageOutcome::Completed);
        report.record(Stage::Embedded, StageOutcome::Completed);
        report.record(Stage::Tagged, StageOutcome::Failed("boom".into()));

        assert_eq!(report.reached, Stage::Embedded);
        assert_eq!(
            report.outcome(Stage::Tagged),
            Some(&StageOutcome::Failed("boom".into()))
        );
        assert_eq!(report.outcome(Stage::Indexed), None);
    }

    #[test]
    fn test_report_serializes_outcomes() {
        let mut report = ProcessReport::new(1);
        report.record(Stage::TextGathered, StageOutcome::Skipped("no text".into()));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["reached"], "created");
        assert_eq!(json["stages"][0][0], "text_gathered");
        assert_eq!(json["stages"][0][1]["outcome"], "skipped");
        assert_eq!(json["stages"][0][1]["reason"], "no text");
    }
}
