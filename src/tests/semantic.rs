//! Scenario tests for the vector index as configured on disk.
//!
//! Tests that load the real embedding model are marked #[ignore].
//! Run with: cargo test -- --ignored

use std::sync::Arc;

use crate::config::Config;
use crate::document::{Document, SourceReference};
use crate::pipeline::{IndexingPipeline, Stage};
use crate::semantic::embeddings::model_id_hash;
use crate::semantic::storage::{IndexStorage, IndexStorageError};
use crate::semantic::{
    Embedder, LazyEmbedder, Tagger, VectorIndex, VectorIndexError, ZeroShotTagger,
};
use crate::tests::fakes::HashEmbedder;

#[test]
fn test_index_from_config_persists_between_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_with(dir.path()).unwrap();

    let index = VectorIndex::from_config(&config);
    for (id, text) in [(17, "stored words"), (42, "fresh text"), (8, "other words")] {
        index.add(id, &HashEmbedder::vector(text)).unwrap();
    }
    assert!(config.index_path().exists());
    assert!(config.mapping_path().exists());

    let mapping = std::fs::read_to_string(config.mapping_path()).unwrap();
    assert_eq!(mapping, r#"{"0":17,"1":42,"2":8}"#);

    let reopened = VectorIndex::from_config(&config);
    assert!(!reopened.is_loaded());
    for query in ["stored words", "fresh text", "other words", "unrelated query"] {
        let vector = HashEmbedder::vector(query);
        assert_eq!(
            index.search_with_distances(&vector, 3).unwrap(),
            reopened.search_with_distances(&vector, 3).unwrap()
        );
    }
    assert!(reopened.is_loaded());
    assert_eq!(reopened.status().unwrap().ntotal, 3);
}

#[test]
fn test_model_change_requires_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let paths = (dir.path().join("vectors.index"), dir.path().join("vector_map.json"));

    let old = VectorIndex::new(
        IndexStorage::new(paths.0.clone(), paths.1.clone(), model_id_hash("old-model")),
        dir.path().to_path_buf(),
        false,
    );
    old.add(1, &[1.0, 0.0]).unwrap();

    let new = VectorIndex::new(
        IndexStorage::new(paths.0, paths.1, model_id_hash("new-model")),
        dir.path().to_path_buf(),
        false,
    );
    assert!(matches!(
        new.search(&[1.0, 0.0], 1),
        Err(VectorIndexError::Storage(IndexStorageError::ModelMismatch))
    ));

    new.rebuild(&[(1, vec![0.0, 1.0, 0.0])]).unwrap();
    assert_eq!(new.search(&[0.0, 1.0, 0.0], 1).unwrap(), vec![1]);
}

#[test]
fn test_interrupted_save_is_rolled_forward_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_with(dir.path()).unwrap();

    let index = VectorIndex::from_config(&config);
    index.add(1, &[1.0, 0.0]).unwrap();
    index.add(2, &[0.0, 1.0]).unwrap();

    // index rename landed, mapping rename did not
    let mut staged = config.mapping_path().into_os_string();
    staged.push(".staged");
    std::fs::rename(config.mapping_path(), &staged).unwrap();
    std::fs::write(config.mapping_path(), r#"{"0":1}"#).unwrap();

    let reopened = VectorIndex::from_config(&config);
    assert_eq!(reopened.search(&[0.0, 1.0], 1).unwrap(), vec![2]);
    assert!(!std::path::Path::new(&staged).exists());
}

#[test]
#[ignore = "requires model download (~23MB)"]
fn test_process_and_query_with_real_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_with(dir.path()).unwrap();
    let pages = [
        (1, "Rust ownership and borrowing explained with examples"),
        (2, "A simple sourdough bread recipe for beginners"),
        (3, "Training convolutional neural networks for image classification"),
    ];

    let mut extractor = crate::tests::fakes::FakeExtractor::default();
    for (id, text) in pages {
        let source = SourceReference::Url(format!("https://docs.example/{id}"));
        extractor = extractor.with(&source, text);
    }

    let embedder = Arc::new(LazyEmbedder::new(
        &config.embedding.model,
        dir.path().to_path_buf(),
        config.embedding.max_input_chars,
    ));
    let tagger: Arc<dyn Tagger> = Arc::new(ZeroShotTagger::new(
        embedder.clone(),
        config.tagging.temperature,
    ));
    let pipeline = IndexingPipeline::new(
        Arc::new(extractor),
        embedder.clone(),
        Some(tagger),
        &config.tagging,
        Arc::new(VectorIndex::from_config(&config)),
    );

    for (id, _) in pages {
        let source = SourceReference::Url(format!("https://docs.example/{id}"));
        let outcome = pipeline.process(Document::new(id, vec![source])).unwrap();
        assert_eq!(outcome.report.reached, Stage::Done);
        assert_eq!(outcome.document.embedding.as_ref().map(|e| e.len()), Some(384));
    }
    assert!(embedder.is_loaded());
    assert_eq!(embedder.dimensions(), Some(384));

    assert_eq!(pipeline.query("baking bread at home", 1).unwrap(), vec![2]);
    assert_eq!(pipeline.query("deep learning for vision", 1).unwrap(), vec![3]);
}
