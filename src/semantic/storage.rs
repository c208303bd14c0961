//! Durable storage for the index/mapping file pair.
//!
//! Index file format:
//!
//! Header (57 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u32 (little-endian)
//! - ntotal: u64 (little-endian)
//! - generation: u64 (little-endian, bumped on every save)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Body:
//! - vectors: [f32; ntotal * dimensions] (little-endian)
//! - payload checksum: u32 (CRC32 of the vector bytes)
//!
//! An emptied index is still written, with dimensions 0 and no vectors,
//! so the generation keeps counting up across a rebuild to nothing.
//!
//! Mapping file: JSON, see `IndexMapping`.
//!
//! Both files are staged next to their targets, fsynced, then renamed
//! index first, mapping second. `load` repairs an interrupted save: a
//! leftover staged index means neither rename happened and the staged
//! files are discarded; a lone staged mapping means the index rename
//! landed and the mapping is rolled forward. Once the index rename has
//! landed the save counts as committed.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{FlatL2Index, IndexError};
use crate::semantic::mapping::IndexMapping;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + dimensions(4) + ntotal(8) + generation(8) + checksum(4)
const HEADER_SIZE: usize = 57;

const STAGED_SUFFIX: &str = "staged";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: index was built with a different embedding model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Mapping file is malformed: {0}")]
    Mapping(#[from] serde_json::Error),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Header of the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u8,
    pub model_id: [u8; 32],
    pub dimensions: u32,
    pub ntotal: u64,
    pub generation: u64,
}

/// What `load` found on disk.
#[derive(Debug, Default)]
pub struct LoadedState {
    /// None when no index file exists yet.
    pub index: Option<FlatL2Index>,
    pub mapping: IndexMapping,
    pub generation: u64,
}

/// Storage manager for the index/mapping pair.
pub struct IndexStorage {
    index_path: PathBuf,
    mapping_path: PathBuf,
    model_id: [u8; 32],
}

impl IndexStorage {
    pub fn new(index_path: PathBuf, mapping_path: PathBuf, model_id: [u8; 32]) -> Self {
        Self {
            index_path,
            mapping_path,
            model_id,
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn mapping_path(&self) -> &Path {
        &self.mapping_path
    }

    pub fn exists(&self) -> bool {
        self.index_path.exists()
    }

    fn staged(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(STAGED_SUFFIX);
        PathBuf::from(name)
    }

    /// Generation of the committed index file, 0 if there is none.
    ///
    /// Only reads the header, so it is cheap enough to call before every
    /// operation to detect writes from other processes.
    pub fn current_generation(&self) -> Result<u64, IndexStorageError> {
        if !self.index_path.exists() {
            return Ok(0);
        }
        let mut reader = BufReader::new(File::open(&self.index_path)?);
        Ok(Self::read_header(&mut reader)?.generation)
    }

    /// Finish or discard a save interrupted between its two renames.
    ///
    /// Must run under the exclusive index lock.
    pub fn recover(&self) -> Result<(), IndexStorageError> {
        let staged_index = Self::staged(&self.index_path);
        let staged_mapping = Self::staged(&self.mapping_path);

        if staged_index.is_file() {
            log::warn!(
                "Discarding interrupted index save ({})",
                staged_index.display()
            );
            std::fs::remove_file(&staged_index)?;
            if staged_mapping.is_file() {
                std::fs::remove_file(&staged_mapping)?;
            }
        } else if staged_mapping.is_file() {
            log::warn!(
                "Completing interrupted index save ({})",
                staged_mapping.display()
            );
            std::fs::rename(&staged_mapping, &self.mapping_path)?;
            sync_parent(&self.mapping_path)?;
        }

        Ok(())
    }

    /// Load the committed pair.
    ///
    /// A missing index file is an empty state; a mapping that does not
    /// match the index vector count is `IndexError::Corruption`.
    pub fn load(&self) -> Result<LoadedState, IndexStorageError> {
        let mapping = if self.mapping_path.exists() {
            IndexMapping::from_json(&std::fs::read(&self.mapping_path)?)?
        } else {
            IndexMapping::new()
        };

        if !self.index_path.exists() {
            if !mapping.is_empty() {
                return Err(IndexError::Corruption {
                    mapped: mapping.len(),
                    ntotal: 0,
                }
                .into());
            }
            return Ok(LoadedState::default());
        }

        let (header, index) = self.read_index()?;

        let ntotal = index.as_ref().map_or(0, FlatL2Index::ntotal);
        let duplicates = mapping.validate(ntotal)?;
        if !duplicates.is_empty() {
            log::warn!(
                "Documents mapped to more than one position: {:?}",
                duplicates
            );
        }

        Ok(LoadedState {
            index,
            mapping,
            generation: header.generation,
        })
    }

    /// Persist the pair. Returns the new generation.
    ///
    /// `None` writes an empty index. An error before the index rename
    /// leaves the committed pair untouched. After it, failures are logged
    /// and the save is reported as committed: `recover` rolls a mapping
    /// that did not get renamed forward.
    pub fn save(
        &self,
        index: Option<&FlatL2Index>,
        mapping: &IndexMapping,
        previous_generation: u64,
    ) -> Result<u64, IndexStorageError> {
        let generation = previous_generation + 1;
        let staged_index = Self::staged(&self.index_path);
        let staged_mapping = Self::staged(&self.mapping_path);

        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.mapping_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let staged = self
            .write_index_file(&staged_index, index, generation)
            .and_then(|_| Self::write_mapping_file(&staged_mapping, mapping));

        if let Err(e) = staged {
            // Clean up staged files on error; the committed pair is untouched
            let _ = std::fs::remove_file(&staged_index);
            let _ = std::fs::remove_file(&staged_mapping);
            return Err(e);
        }

        if let Err(e) = std::fs::rename(&staged_index, &self.index_path) {
            let _ = std::fs::remove_file(&staged_index);
            let _ = std::fs::remove_file(&staged_mapping);
            return Err(e.into());
        }

        if let Err(e) = std::fs::rename(&staged_mapping, &self.mapping_path) {
            log::error!(
                "Index generation {} committed but its mapping is still staged at {}: {}",
                generation,
                staged_mapping.display(),
                e
            );
            return Ok(generation);
        }
        for path in [&self.index_path, &self.mapping_path] {
            if let Err(e) = sync_parent(path) {
                log::warn!("Failed to sync directory of {}: {}", path.display(), e);
            }
        }

        Ok(generation)
    }

    /// Header plus vectors; the index is None when the file holds an
    /// emptied index.
    fn read_index(&self) -> Result<(IndexHeader, Option<FlatL2Index>), IndexStorageError> {
        let file = File::open(&self.index_path)?;
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        if header.model_id != self.model_id {
            return Err(IndexStorageError::ModelMismatch);
        }

        let dimensions = header.dimensions as usize;
        let count = (header.ntotal as usize)
            .checked_mul(dimensions)
            .ok_or_else(|| IndexStorageError::InvalidFormat("vector count overflows".into()))?;

        let mut hasher = crc32fast::Hasher::new();
        let mut data = Vec::with_capacity(count);
        let mut float_bytes = [0u8; 4];
        for _ in 0..count {
            reader.read_exact(&mut float_bytes)?;
            hasher.update(&float_bytes);
            data.push(f32::from_le_bytes(float_bytes));
        }

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != hasher.finalize() {
            return Err(IndexStorageError::ChecksumMismatch);
        }

        if dimensions == 0 {
            if header.ntotal != 0 {
                return Err(IndexStorageError::InvalidFormat(
                    "vectors without dimensions".into(),
                ));
            }
            return Ok((header, None));
        }

        let index = FlatL2Index::from_raw(dimensions, data)?;
        Ok((header, Some(index)))
    }

    fn read_header<R: Read>(reader: &mut R) -> Result<IndexHeader, IndexStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IndexStorageError::InvalidFormat("truncated header".into())
            } else {
                e.into()
            }
        })?;

        let version = header_bytes[0];

        // Version check first
        if version != FORMAT_VERSION {
            return Err(IndexStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        // Verify checksum (computed over header without checksum field)
        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[53..57]));
        if stored_checksum != crc32fast::hash(&header_bytes[0..53]) {
            return Err(IndexStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        Ok(IndexHeader {
            version,
            model_id,
            dimensions: u32::from_le_bytes(le_array(&header_bytes[33..37])),
            ntotal: u64::from_le_bytes(le_array(&header_bytes[37..45])),
            generation: u64::from_le_bytes(le_array(&header_bytes[45..53])),
        })
    }

    fn write_index_file(
        &self,
        path: &Path,
        index: Option<&FlatL2Index>,
        generation: u64,
    ) -> Result<(), IndexStorageError> {
        let dimensions = index.map_or(0, FlatL2Index::dimensions);
        let ntotal = index.map_or(0, FlatL2Index::ntotal);
        let vectors = index.map_or(&[][..], FlatL2Index::raw);

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes[0] = FORMAT_VERSION;
        header_bytes[1..33].copy_from_slice(&self.model_id);
        header_bytes[33..37].copy_from_slice(&(dimensions as u32).to_le_bytes());
        header_bytes[37..45].copy_from_slice(&ntotal.to_le_bytes());
        header_bytes[45..53].copy_from_slice(&generation.to_le_bytes());
        let checksum = crc32fast::hash(&header_bytes[0..53]);
        header_bytes[53..57].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header_bytes)?;

        let mut hasher = crc32fast::Hasher::new();
        for value in vectors {
            let bytes = value.to_le_bytes();
            hasher.update(&bytes);
            writer.write_all(&bytes)?;
        }
        writer.write_all(&hasher.finalize().to_le_bytes())?;

        // Flush and sync
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn write_mapping_file(path: &Path, mapping: &IndexMapping) -> Result<(), IndexStorageError> {
        let mut file = File::create(path)?;
        file.write_all(&mapping.to_json()?)?;
        file.sync_all()?;
        Ok(())
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// fsync the directory so a rename survives a crash.
#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
