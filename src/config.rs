use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::DEFAULT_MODEL;
use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

/// Characters of document text fed to the embedding model
const DEFAULT_MAX_INPUT_CHARS: usize = 2048;

const DEFAULT_TAG_THRESHOLD: f32 = 0.3;
const DEFAULT_TAG_TEMPERATURE: f32 = 0.05;

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

const DEFAULT_INDEX_FILE: &str = "vectors.index";
const DEFAULT_MAPPING_FILE: &str = "vector_map.json";

pub const DEFAULT_LABELS: [&str; 12] = [
    "natural language processing",
    "machine learning",
    "deep learning",
    "computer vision",
    "data science",
    "ai",
    "tutorial",
    "paper",
    "web development",
    "python",
    "chat log",
    "research",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Text longer than this is truncated before embedding
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum label score [0.0, 1.0]
    #[serde(default = "default_tag_threshold")]
    pub threshold: f32,

    /// Softmax temperature applied to label similarities
    #[serde(default = "default_tag_temperature")]
    pub temperature: f32,

    /// Candidate labels
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_TAG_THRESHOLD,
            temperature: DEFAULT_TAG_TEMPERATURE,
            labels: default_labels(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_mapping_file")]
    pub mapping_file: String,

    /// Fail searches that hit an unmapped index position instead of
    /// skipping them
    #[serde(default)]
    pub strict_mapping: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            mapping_file: default_mapping_file(),
            strict_mapping: false,
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_input_chars() -> usize {
    DEFAULT_MAX_INPUT_CHARS
}

fn default_true() -> bool {
    true
}

fn default_tag_threshold() -> f32 {
    DEFAULT_TAG_THRESHOLD
}

fn default_tag_temperature() -> f32 {
    DEFAULT_TAG_TEMPERATURE
}

fn default_labels() -> Vec<String> {
    DEFAULT_LABELS.iter().map(|l| l.to_string()).collect()
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    format!("smartmarks/{}", env!("CARGO_PKG_VERSION"))
}

fn default_index_file() -> String {
    DEFAULT_INDEX_FILE.to_string()
}

fn default_mapping_file() -> String {
    DEFAULT_MAPPING_FILE.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub tagging: TaggingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let tagging = &self.tagging;
        if !(0.0..=1.0).contains(&tagging.threshold) {
            bail!(
                "tagging.threshold must be between 0.0 and 1.0, got {}",
                tagging.threshold
            );
        }
        if tagging.temperature <= 0.0 || !tagging.temperature.is_finite() {
            bail!(
                "tagging.temperature must be a positive number, got {}",
                tagging.temperature
            );
        }

        if self.extraction.fetch_timeout_secs == 0 {
            bail!("extraction.fetch_timeout_secs must be greater than 0");
        }

        if self.embedding.max_input_chars == 0 {
            bail!("embedding.max_input_chars must be greater than 0");
        }

        let index = &self.index;
        if index.index_file.trim().is_empty() || index.mapping_file.trim().is_empty() {
            bail!("index.index_file and index.mapping_file must not be empty");
        }
        if index.index_file == index.mapping_file {
            bail!(
                "index.index_file and index.mapping_file must differ, both are '{}'",
                index.index_file
            );
        }

        Ok(())
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store
                .write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())
                .context("failed to write default config")?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        if config.tagging.labels.is_empty() {
            log::warn!("tagging.labels is empty, using the default labels");
            config.tagging.labels = default_labels();
        }

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store
            .write(CONFIG_FILE, config_str.as_bytes())
            .context("failed to save config")?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index_path(&self) -> PathBuf {
        self.base_path.join(&self.index.index_file)
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.base_path.join(&self.index.mapping_file)
    }
}
