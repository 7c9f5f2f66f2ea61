use std::path::Path;

use crate::storage::{BackendLocal, StorageManager};
use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE: &str = "settings.yaml";

/// Default duplicate/version similarity threshold
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.9;
/// Default semantic weight for hybrid search
const DEFAULT_SEMANTIC_WEIGHT: f32 = 0.6;
const DEFAULT_TOP_K: usize = 20;
const DEFAULT_PARALLELISM: usize = 4;
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Characters of extracted text sent to a provider per file
const DEFAULT_MAX_CONTENT_CHARS: usize = 32_000;
const DEFAULT_MAX_ERRORS: usize = 1000;
const DEFAULT_CLUSTER_SEED: u64 = 42;
const DEFAULT_CLUSTER_ITERATIONS: usize = 50;
/// Leading bytes of each file matched by lexical search
const DEFAULT_MAX_TEXT_BYTES: usize = 64 * 1024;

pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "md", "txt", "text", "markdown", "mdx", "py", "pyw", "pyi", "js", "jsx", "ts", "tsx", "json",
    "yaml", "yml", "toml", "ini", "cfg", "html", "htm", "css", "scss", "sass", "rs", "go", "java",
    "c", "cpp", "h", "hpp", "sh", "bash", "zsh", "ps1", "bat", "cmd", "xml", "svg", "log",
];

const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    ".git",
    "__pycache__",
    ".venv",
    "dist",
    "build",
];

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("provider `{provider}` is missing required field `{field}`")]
    MissingField {
        provider: &'static str,
        field: &'static str,
    },

    #[error("provider `{0}` has no credential configured")]
    MissingCredential(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed yaml: {0}")]
    Yaml(#[from] serde_yml::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Extensions indexed when a scan does not pass its own list
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Directory names never descended into
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,

    #[serde(default)]
    pub include_hidden: bool,

    #[serde(default)]
    pub follow_links: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            excluded_dirs: default_excluded_dirs(),
            include_hidden: false,
            follow_links: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    /// Files per batch. Derived from the provider when unset.
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Concurrent provider requests per batch
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Per-file error messages kept in the run progress
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            parallelism: DEFAULT_PARALLELISM,
            max_retries: DEFAULT_MAX_RETRIES,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            max_errors: DEFAULT_MAX_ERRORS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusteringConfig {
    #[serde(default = "default_cluster_seed")]
    pub seed: u64,

    #[serde(default = "default_cluster_iterations")]
    pub max_iterations: usize,

    /// Upper bound applied to the automatic sqrt(n) choice of k
    #[serde(default)]
    pub max_k: Option<usize>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_CLUSTER_SEED,
            max_iterations: DEFAULT_CLUSTER_ITERATIONS,
            max_k: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimilarityConfig {
    #[serde(default = "default_similarity_threshold")]
    pub threshold: f32,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
            top_k: DEFAULT_TOP_K,
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
        }
    }
}

fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

fn default_excluded_dirs() -> Vec<String> {
    DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect()
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_max_content_chars() -> usize {
    DEFAULT_MAX_CONTENT_CHARS
}

fn default_max_errors() -> usize {
    DEFAULT_MAX_ERRORS
}

fn default_cluster_seed() -> u64 {
    DEFAULT_CLUSTER_SEED
}

fn default_cluster_iterations() -> usize {
    DEFAULT_CLUSTER_ITERATIONS
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_semantic_weight() -> f32 {
    DEFAULT_SEMANTIC_WEIGHT
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_max_text_bytes() -> usize {
    DEFAULT_MAX_TEXT_BYTES
}

/// Per-index settings, stored as `settings.yaml` in the storage directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity.threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity.threshold must be between 0.0 and 1.0, got {}",
                self.similarity.threshold
            )));
        }

        if !(0.0..=1.0).contains(&self.search.semantic_weight) {
            return Err(ConfigError::Invalid(format!(
                "search.semantic_weight must be between 0.0 and 1.0, got {}",
                self.search.semantic_weight
            )));
        }

        if self.embedding.batch_size == Some(0) {
            return Err(ConfigError::Invalid(
                "embedding.batch_size must be greater than 0".into(),
            ));
        }

        if self.embedding.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "embedding.parallelism must be greater than 0".into(),
            ));
        }

        if self.clustering.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "clustering.max_iterations must be greater than 0".into(),
            ));
        }

        if self.clustering.max_k == Some(0) {
            return Err(ConfigError::Invalid(
                "clustering.max_k must be greater than 0".into(),
            ));
        }

        if self.search.top_k == 0 {
            return Err(ConfigError::Invalid(
                "search.top_k must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Load settings from `storage_dir`, writing defaults when missing.
    pub fn load_with(storage_dir: &Path) -> Result<Self, ConfigError> {
        let store = BackendLocal::new(storage_dir)?;

        // create new if does not exist
        if !store.exists(SETTINGS_FILE) {
            store.write(
                SETTINGS_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str = String::from_utf8(store.read(SETTINGS_FILE)?)
            .map_err(|_| ConfigError::Invalid("settings file is not valid utf8".into()))?;
        let config: Self = serde_yml::from_str(&config_str)?;

        config.validate()?;

        // resave in case new fields were added since the file was written
        let normalized = serde_yml::to_string(&config)?;
        if config_str != normalized {
            store.write(SETTINGS_FILE, normalized.as_bytes())?;
        }

        Ok(config)
    }

    pub fn save(&self, storage_dir: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let store = BackendLocal::new(storage_dir)?;
        store.write(SETTINGS_FILE, serde_yml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert_eq!(config, Config::default());
        assert!(tmp.path().join(SETTINGS_FILE).exists());
        assert_eq!(config.similarity.threshold, 0.9);
        assert!(config.scan.extensions.contains(&"rs".to_string()));
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(SETTINGS_FILE),
            "similarity:\n  threshold: 0.75\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.similarity.threshold, 0.75);
        assert_eq!(config.embedding.parallelism, DEFAULT_PARALLELISM);

        // file upgraded with the missing sections
        let saved = std::fs::read_to_string(tmp.path().join(SETTINGS_FILE)).unwrap();
        assert!(saved.contains("parallelism"));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(SETTINGS_FILE),
            "similarity:\n  threshold: 1.5\n",
        )
        .unwrap();

        let err = Config::load_with(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = Config::default();
        config.embedding.parallelism = 0;
        assert!(config.validate().is_err());
    }
}
