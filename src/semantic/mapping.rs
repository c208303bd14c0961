//! Position → document id mapping for the flat index.
//!
//! Serialized as a JSON object with string-encoded positions, e.g.
//! `{"0": 17, "1": 42}`.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::semantic::index::IndexError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexMapping {
    entries: BTreeMap<u64, u64>,
}

impl IndexMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, position: u64) -> Option<u64> {
        self.entries.get(&position).copied()
    }

    pub fn insert(&mut self, position: u64, document_id: u64) {
        self.entries.insert(position, document_id);
    }

    pub(crate) fn remove(&mut self, position: u64) -> Option<u64> {
        self.entries.remove(&position)
    }

    /// Position a document is stored at, if any.
    pub fn position_of(&self, document_id: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, id)| **id == document_id)
            .map(|(position, _)| *position)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().map(|(p, id)| (*p, *id))
    }

    /// Check the mapping against an index holding `ntotal` vectors.
    ///
    /// Returns the ids that appear at more than one position. Those are
    /// tolerated on load (older data may contain them) but never created.
    pub fn validate(&self, ntotal: u64) -> Result<Vec<u64>, IndexError> {
        let corruption = IndexError::Corruption {
            mapped: self.len(),
            ntotal,
        };
        if self.len() as u64 != ntotal {
            return Err(corruption);
        }
        if self.entries.keys().any(|position| *position >= ntotal) {
            return Err(corruption);
        }

        let mut seen: HashMap<u64, usize> = HashMap::new();
        for id in self.entries.values() {
            *seen.entry(*id).or_default() += 1;
        }
        let mut duplicates: Vec<u64> = seen
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id)
            .collect();
        duplicates.sort_unstable();

        Ok(duplicates)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
