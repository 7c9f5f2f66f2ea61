//! Local inference through fastembed.
//!
//! - Model is loaded lazily on the first embed call
//! - Model files are cached under the index's `models/` directory
//! - Output width comes from a static table so the cache identity is known
//!   without loading the model

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{InitOptions, TextEmbedding};

use super::{check_vectors, truncate_input, EmbeddingProvider, ProviderError};
use crate::config::ConfigError;

const PROVIDER: &str = "local";
const MAX_BATCH_SIZE: usize = 32;

pub const SUPPORTED_MODELS: &[&str] = &[
    "all-minilm-l6-v2",
    "bge-small-en-v1.5",
    "bge-base-en-v1.5",
    "bge-large-en-v1.5",
];

/// Output dimensions per supported model name (quantized `-q` variants included).
pub fn dimensions_for(model: &str) -> Option<usize> {
    let name = model.to_lowercase();
    let base = name.strip_suffix("-q").unwrap_or(&name);
    match base.strip_prefix("baai/").unwrap_or(base) {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" => Some(384),
        "bge-base-en-v1.5" => Some(768),
        "bge-large-en-v1.5" => Some(1024),
        _ => None,
    }
}

/// Parse model name string to fastembed enum.
fn parse_model_name(name: &str) -> Option<fastembed::EmbeddingModel> {
    let name = name.to_lowercase();
    match name.strip_prefix("baai/").unwrap_or(&name) {
        "all-minilm-l6-v2" => Some(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" => Some(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" => Some(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-small-en-v1.5-q" => Some(fastembed::EmbeddingModel::BGESmallENV15Q),
        "bge-base-en-v1.5" => Some(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-base-en-v1.5-q" => Some(fastembed::EmbeddingModel::BGEBaseENV15Q),
        "bge-large-en-v1.5" => Some(fastembed::EmbeddingModel::BGELargeENV15),
        "bge-large-en-v1.5-q" => Some(fastembed::EmbeddingModel::BGELargeENV15Q),
        _ => None,
    }
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct LocalProvider {
    model_name: String,
    model_kind: fastembed::EmbeddingModel,
    dimensions: usize,
    models_dir: PathBuf,
    model: Mutex<Option<TextEmbedding>>,
}

impl LocalProvider {
    pub fn new(model_name: &str, models_dir: PathBuf) -> Result<Self, ConfigError> {
        let unknown = || {
            ConfigError::Invalid(format!(
                "unknown local model `{model_name}`; supported: {} (add -q for quantized)",
                SUPPORTED_MODELS.join(", ")
            ))
        };
        let model_kind = parse_model_name(model_name).ok_or_else(unknown)?;
        let dimensions = dimensions_for(model_name).ok_or_else(unknown)?;

        Ok(Self {
            model_name: model_name.to_lowercase(),
            model_kind,
            dimensions,
            models_dir,
            model: Mutex::new(None),
        })
    }

    fn model_error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Model {
            provider: PROVIDER.to_string(),
            message: message.into(),
        }
    }

    fn load_model(&self) -> Result<TextEmbedding, ProviderError> {
        std::fs::create_dir_all(&self.models_dir).map_err(|e| {
            self.model_error(format!("failed to create models directory: {e}"))
        })?;

        log::info!(
            "loading local model {} from {}",
            self.model_name,
            self.models_dir.display()
        );
        let options = InitOptions::new(self.model_kind.clone())
            .with_cache_dir(self.models_dir.clone())
            .with_show_download_progress(false);

        TextEmbedding::try_new(options).map_err(|e| self.model_error(e.to_string()))
    }
}

impl EmbeddingProvider for LocalProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(vec![]);
        }

        let mut guard = self
            .model
            .lock()
            .map_err(|e| self.model_error(format!("Failed to acquire model lock: {e}")))?;

        if guard.is_none() {
            *guard = Some(self.load_model()?);
        }
        let Some(model) = guard.as_mut() else {
            return Err(self.model_error("model not loaded"));
        };

        let texts: Vec<String> = inputs.iter().map(|t| truncate_input(t).to_string()).collect();
        let vectors = model
            .embed(texts, None)
            .map_err(|e| self.model_error(e.to_string()))?;

        check_vectors(PROVIDER, inputs.len(), self.dimensions, vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_table() {
        assert_eq!(dimensions_for("bge-small-en-v1.5"), Some(384));
        assert_eq!(dimensions_for("BAAI/bge-small-en-v1.5"), Some(384));
        assert_eq!(dimensions_for("bge-base-en-v1.5-q"), Some(768));
        assert_eq!(dimensions_for("all-MiniLM-L6-v2"), Some(384));
        assert_eq!(dimensions_for("gpt-4"), None);
    }

    #[test]
    fn test_invalid_model_name() {
        let result = LocalProvider::new("nonexistent-model", std::env::temp_dir());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_construction_is_lazy() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("bge-small-en-v1.5", tmp.path().join("models")).unwrap();
        assert_eq!(provider.dimensions(), 384);
        // nothing downloaded until the first embed
        assert!(!tmp.path().join("models").exists());
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_embedding_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("all-MiniLM-L6-v2", tmp.path().to_path_buf()).unwrap();

        let vectors = provider.embed(&["Hello, world!".to_string()]).unwrap();
        assert_eq!(vectors[0].len(), 384);

        // Check that values are normalized (L2 norm ~= 1)
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }
}
