use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a document's content comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceReference {
    Url(String),
    File(PathBuf),
}

impl Display for SourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceReference::Url(url) => write!(f, "{url}"),
            SourceReference::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A bookmark as seen by the indexing core.
///
/// The surrounding application owns persistence; the core only reads
/// `sources` and fills in `text`, `embedding` and `tags`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    #[serde(default)]
    pub sources: Vec<SourceReference>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Document {
    pub fn new(id: u64, sources: Vec<SourceReference>) -> Self {
        Self {
            id,
            sources,
            ..Default::default()
        }
    }
}

pub fn parse_tags(tags: String) -> Vec<String> {
    tags.split(',')
        .flat_map(|value| value.split(' ').filter(|value| !value.is_empty()))
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
}
