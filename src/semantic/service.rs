//! Process-wide vector index service.
//!
//! Owns the in-memory flat index and its id mapping:
//! - Lazy-loads both from disk on first use
//! - Serializes writers with an exclusive file lock plus the state RwLock
//! - Lets readers share both locks
//! - Reloads when another process has committed a newer generation

use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::config::Config;
use crate::lock::{IndexLock, LockMode};
use crate::semantic::embeddings::model_id_hash;
use crate::semantic::index::{FlatL2Index, IndexError};
use crate::semantic::mapping::IndexMapping;
use crate::semantic::storage::{IndexStorage, IndexStorageError, LoadedState};

/// Errors that can occur during vector index operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorIndexError {
    #[error("{0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(IndexStorageError),

    #[error("Failed to lock index: {0}")]
    Lock(std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<IndexStorageError> for VectorIndexError {
    fn from(e: IndexStorageError) -> Self {
        match e {
            // keep corruption recognizable regardless of where it surfaced
            IndexStorageError::Index(inner) => VectorIndexError::Index(inner),
            other => VectorIndexError::Storage(other),
        }
    }
}

impl VectorIndexError {
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VectorIndexError::Index(IndexError::Corruption { .. })
                | VectorIndexError::Index(IndexError::UnmappedPosition(_))
        )
    }

    /// The files on disk cannot be used as they are; `rebuild` fixes it.
    pub fn needs_rebuild(&self) -> bool {
        self.is_corruption()
            || matches!(
                self,
                VectorIndexError::Index(IndexError::DimensionMismatch { .. })
                    | VectorIndexError::Storage(
                        IndexStorageError::InvalidFormat(_)
                            | IndexStorageError::VersionMismatch(..)
                            | IndexStorageError::ModelMismatch
                            | IndexStorageError::ChecksumMismatch
                            | IndexStorageError::Mapping(_)
                    )
            )
    }

    /// The machine failed us (disk, lock file, poisoned state) rather than
    /// the index contents.
    pub fn is_catastrophic(&self) -> bool {
        matches!(
            self,
            VectorIndexError::Storage(IndexStorageError::Io(_))
                | VectorIndexError::Lock(_)
                | VectorIndexError::Internal(_)
        )
    }
}

/// A resolved search hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub document_id: u64,
    /// Squared L2 distance
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub ntotal: u64,
    pub dimensions: Option<usize>,
    pub mapped: usize,
    pub generation: u64,
}

/// In-memory mirror of the committed file pair.
#[derive(Debug, Default)]
struct IndexState {
    index: Option<FlatL2Index>,
    mapping: IndexMapping,
    generation: u64,
}

impl From<LoadedState> for IndexState {
    fn from(loaded: LoadedState) -> Self {
        Self {
            index: loaded.index,
            mapping: loaded.mapping,
            generation: loaded.generation,
        }
    }
}

pub struct VectorIndex {
    storage: IndexStorage,
    lock_dir: PathBuf,
    strict_mapping: bool,
    /// None until first access.
    state: RwLock<Option<IndexState>>,
}

impl VectorIndex {
    pub fn new(storage: IndexStorage, lock_dir: PathBuf, strict_mapping: bool) -> Self {
        Self {
            storage,
            lock_dir,
            strict_mapping,
            state: RwLock::new(None),
        }
    }

    /// Index files from config, stamped with the embedding model's id.
    pub fn from_config(config: &Config) -> Self {
        let storage = IndexStorage::new(
            config.index_path(),
            config.mapping_path(),
            model_id_hash(&config.embedding.model),
        );
        Self::new(
            storage,
            config.base_path().to_path_buf(),
            config.index.strict_mapping,
        )
    }

    /// Append `vector` for `document_id` and persist before returning.
    ///
    /// Returns the assigned position. On error neither memory nor the
    /// committed files have changed. Once the index file is committed the
    /// add has happened, even if the mapping is only completed by the next
    /// load.
    pub fn add(&self, document_id: u64, vector: &[f32]) -> Result<u64, VectorIndexError> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut guard = self.write_state()?;
        self.refresh(&mut guard)?;
        let state = guard
            .as_mut()
            .ok_or_else(|| VectorIndexError::Internal("index state missing after load".into()))?;

        if let Some(position) = state.mapping.position_of(document_id) {
            log::debug!("document {document_id} already at position {position}");
            return Err(IndexError::AlreadyIndexed(document_id).into());
        }

        let created = state.index.is_none();
        if created {
            state.index = Some(FlatL2Index::new(vector.len())?);
        }
        let index = state
            .index
            .as_mut()
            .ok_or_else(|| VectorIndexError::Internal("index missing after creation".into()))?;

        let position = match index.add(vector) {
            Ok(position) => position,
            Err(e) => {
                if created {
                    state.index = None;
                }
                return Err(e.into());
            }
        };
        state.mapping.insert(position, document_id);

        match self.storage.save(Some(&*index), &state.mapping, state.generation) {
            Ok(generation) => {
                state.generation = generation;
                log::debug!("indexed document {document_id} at position {position}");
                Ok(position)
            }
            Err(e) => {
                index.truncate(position);
                state.mapping.remove(position);
                if created {
                    state.index = None;
                }
                Err(e.into())
            }
        }
    }

    /// Document ids of the `min(k, ntotal)` nearest vectors, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<u64>, VectorIndexError> {
        Ok(self
            .search_with_distances(query, k)?
            .into_iter()
            .map(|hit| hit.document_id)
            .collect())
    }

    /// Same as `search()` but returns distances too.
    pub fn search_with_distances(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>, VectorIndexError> {
        {
            let _lock = self.lock(LockMode::Shared)?;
            let guard = self.read_state()?;
            if let Some(state) = guard.as_ref() {
                if state.generation == self.storage.current_generation()? {
                    return self.resolve(state, query, k);
                }
            }
        }

        // first access or stale: reload under the writer lock
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut guard = self.write_state()?;
        self.refresh(&mut guard)?;
        let state = guard
            .as_ref()
            .ok_or_else(|| VectorIndexError::Internal("index state missing after load".into()))?;
        self.resolve(state, query, k)
    }

    /// Replace everything with a fresh index built from `records`.
    ///
    /// This is the recovery path for a corrupted pair or a model change:
    /// the old files are never read. An empty `records` still writes an
    /// (empty) index so the generation keeps increasing.
    pub fn rebuild(&self, records: &[(u64, Vec<f32>)]) -> Result<IndexStatus, VectorIndexError> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut guard = self.write_state()?;

        let mut mapping = IndexMapping::new();
        let mut index = match records.first() {
            Some((_, vector)) => Some(FlatL2Index::new(vector.len())?),
            None => None,
        };

        for (document_id, vector) in records {
            if mapping.position_of(*document_id).is_some() {
                return Err(IndexError::AlreadyIndexed(*document_id).into());
            }
            if let Some(index) = index.as_mut() {
                let position = index.add(vector)?;
                mapping.insert(position, *document_id);
            }
        }

        // the on-disk header may be unreadable, so never go backwards
        let cached = guard.as_ref().map(|s| s.generation).unwrap_or(0);
        let on_disk = self.storage.current_generation().unwrap_or(0);
        let previous = cached.max(on_disk);

        if let Err(e) = self.storage.recover() {
            log::warn!("Ignoring leftover staged files: {}", e);
        }
        let generation = self.storage.save(index.as_ref(), &mapping, previous)?;

        log::info!("Rebuilt vector index with {} vectors", mapping.len());
        let state = IndexState {
            index,
            mapping,
            generation,
        };
        let status = Self::status_of(&state);
        *guard = Some(state);

        Ok(status)
    }

    pub fn status(&self) -> Result<IndexStatus, VectorIndexError> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut guard = self.write_state()?;
        self.refresh(&mut guard)?;
        guard
            .as_ref()
            .map(Self::status_of)
            .ok_or_else(|| VectorIndexError::Internal("index state missing after load".into()))
    }

    /// Check if the state has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.state
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn status_of(state: &IndexState) -> IndexStatus {
        IndexStatus {
            ntotal: state.index.as_ref().map(|i| i.ntotal()).unwrap_or(0),
            dimensions: state.index.as_ref().map(|i| i.dimensions()),
            mapped: state.mapping.len(),
            generation: state.generation,
        }
    }

    fn resolve(
        &self,
        state: &IndexState,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>, VectorIndexError> {
        let Some(index) = state.index.as_ref() else {
            return Ok(vec![]);
        };

        let mut hits = Vec::new();
        for neighbor in index.search(query, k)? {
            match state.mapping.get(neighbor.position) {
                Some(document_id) => hits.push(SearchHit {
                    document_id,
                    distance: neighbor.distance,
                }),
                None if self.strict_mapping => {
                    return Err(IndexError::UnmappedPosition(neighbor.position).into());
                }
                None => {
                    log::warn!(
                        "index position {} has no mapping entry, skipping",
                        neighbor.position
                    );
                }
            }
        }

        Ok(hits)
    }

    /// Load or reload if the cache is missing or behind the committed
    /// generation. Caller holds the exclusive file lock.
    fn refresh(&self, guard: &mut Option<IndexState>) -> Result<(), VectorIndexError> {
        self.storage.recover()?;

        let on_disk = self.storage.current_generation()?;
        if let Some(state) = guard.as_ref() {
            if state.generation == on_disk {
                return Ok(());
            }
            log::info!(
                "Vector index changed on disk (generation {} -> {}), reloading",
                state.generation,
                on_disk
            );
        }

        match self.storage.load() {
            Ok(loaded) => {
                if let Some(index) = loaded.index.as_ref() {
                    log::info!("Loaded {} vectors from storage", index.ntotal());
                } else {
                    log::info!("No existing index, starting fresh");
                }
                *guard = Some(loaded.into());
                Ok(())
            }
            Err(e) => {
                // drop the stale cache; nothing may run against a bad pair
                *guard = None;
                log::error!("Failed to load vector index: {}", e);
                Err(e.into())
            }
        }
    }

    fn lock(&self, mode: LockMode) -> Result<IndexLock, VectorIndexError> {
        IndexLock::acquire(&self.lock_dir, mode).map_err(VectorIndexError::Lock)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, Option<IndexState>>, VectorIndexError> {
        self.state
            .read()
            .map_err(|e| VectorIndexError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, Option<IndexState>>, VectorIndexError> {
        self.state
            .write()
            .map_err(|e| VectorIndexError::Internal(format!("Lock poisoned: {}", e)))
    }
}
