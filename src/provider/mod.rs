//! Provider Gateway: one interface over every embedding backend.
//!
//! # Backends
//!
//! - `local`: in-process fastembed inference
//! - `hashing`: deterministic feature hashing, fully offline
//! - `azure`, `vertex`, `openai`: remote HTTP APIs
//! - `multi`: ordered fallback over any of the above
//!
//! Callers never pick a backend themselves. The per-index [`ProviderConfig`]
//! is turned into a provider by [`build`] and passed down explicitly.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ConfigError;
use crate::semantic::cache::EmbeddingSpace;

mod azure;
pub mod config;
mod hashing;
mod http;
mod local;
mod multi;
mod openai;
mod vertex;

pub use azure::AzureProvider;
pub use config::{describe, Credentials, ProviderConfig, ProviderView};
pub use hashing::HashingProvider;
pub use local::LocalProvider;
pub use multi::MultiProvider;
pub use openai::OpenAiProvider;
pub use vertex::VertexProvider;

/// Maximum characters of a single input forwarded to any provider
pub const MAX_INPUT_CHARS: usize = 32_000;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("{provider}: authentication failed (status {status}): {message}")]
    Authentication {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: rate limited after {attempts} attempt(s)")]
    RateLimited { provider: String, attempts: u32 },

    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },

    #[error("{provider}: http {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: invalid response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("{provider}: model error: {message}")]
    Model { provider: String, message: String },

    #[error("all providers failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),

    #[error("{provider}: cannot produce vectors for {space}")]
    SpaceUnavailable { provider: String, space: String },
}

impl ProviderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Authentication { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Authentication { status, .. } | ProviderError::Http { status, .. } => {
                Some(*status)
            }
            ProviderError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub(crate) fn invalid(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of exercising one provider's endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationReport {
    pub provider: String,
    pub success: bool,
    pub message: String,
    pub resolved_url: Option<String>,
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tried_versions: Vec<String>,
    pub suggested_endpoint: Option<String>,
}

impl ValidationReport {
    pub fn from_result<T>(
        provider: &str,
        resolved_url: Option<String>,
        result: &Result<T, ProviderError>,
    ) -> Self {
        let (success, message, status_code) = match result {
            Ok(_) => (true, "connection ok".to_string(), Some(200)),
            Err(e) => (false, e.to_string(), e.status_code()),
        };
        ValidationReport {
            provider: provider.to_string(),
            success,
            message,
            resolved_url,
            status_code,
            tried_versions: vec![],
            suggested_endpoint: None,
        }
    }
}

pub trait EmbeddingProvider: Send + Sync {
    /// Provider kind, e.g. `azure`
    fn id(&self) -> &str;

    /// Model or deployment identifier
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Inputs per request the backend is comfortable with
    fn max_batch_size(&self) -> usize;

    /// One vector per input, in input order.
    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Request URL, for remote providers.
    fn endpoint(&self) -> Option<String> {
        None
    }

    fn space(&self) -> EmbeddingSpace {
        EmbeddingSpace::new(self.id(), self.model(), self.dimensions())
    }

    /// Spaces this provider may write into, preferred first.
    fn spaces(&self) -> Vec<EmbeddingSpace> {
        vec![self.space()]
    }

    /// [`Self::embed`], naming the space the vectors belong to.
    fn embed_tagged(
        &self,
        inputs: &[String],
    ) -> Result<(EmbeddingSpace, Vec<Vec<f32>>), ProviderError> {
        Ok((self.space(), self.embed(inputs)?))
    }

    /// Embed a search query so it compares against documents stored in `space`.
    fn embed_query(&self, space: &EmbeddingSpace, query: &str) -> Result<Vec<f32>, ProviderError> {
        if *space != self.space() {
            return Err(ProviderError::SpaceUnavailable {
                provider: self.id().to_string(),
                space: space.label(),
            });
        }
        self.embed(&[query.to_string()])?
            .pop()
            .ok_or_else(|| ProviderError::invalid(self.id(), "no vector for the query"))
    }

    /// Drop state that should only last one embedding run.
    fn begin_run(&self) {}

    /// Send a tiny request and report what happened.
    fn validate(&self) -> ValidationReport {
        let result = self.embed(&["connection test".to_string()]);
        ValidationReport::from_result(self.id(), self.endpoint(), &result)
    }
}

/// Check shape of a provider response: one vector per input, declared width.
pub(crate) fn check_vectors(
    provider: &str,
    inputs: usize,
    dimensions: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if vectors.len() != inputs {
        return Err(ProviderError::invalid(
            provider,
            format!("expected {inputs} vectors, got {}", vectors.len()),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(ProviderError::invalid(
            provider,
            format!("expected {dimensions} dimensions, got {}", bad.len()),
        ));
    }
    Ok(vectors)
}

/// Truncate on a char boundary.
pub(crate) fn truncate_input(text: &str) -> &str {
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Runtime knobs that are not part of the provider document itself.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub models_dir: PathBuf,
    pub max_retries: u32,
}

/// Turn a validated config into a live provider.
pub fn build(
    config: &ProviderConfig,
    credentials: &Credentials,
    ctx: &BuildContext,
) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    config.validate(credentials)?;
    build_unchecked(config, credentials, ctx)
}

fn build_unchecked(
    config: &ProviderConfig,
    credentials: &Credentials,
    ctx: &BuildContext,
) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    let secret = |config: &ProviderConfig| -> Result<String, ConfigError> {
        let key = config.credential_key().unwrap_or_default();
        credentials
            .get(&key)
            .map(str::to_string)
            .ok_or(ConfigError::MissingCredential(key))
    };

    let provider: Arc<dyn EmbeddingProvider> = match config {
        ProviderConfig::Local { model } => Arc::new(LocalProvider::new(model, ctx.models_dir.clone())?),
        ProviderConfig::Hashing { dimensions } => Arc::new(HashingProvider::new(*dimensions)),
        ProviderConfig::Azure {
            endpoint,
            deployment,
            api_version,
            ..
        } => Arc::new(AzureProvider::new(
            endpoint,
            deployment,
            api_version.as_deref(),
            secret(config)?,
            config.dimensions()?,
            ctx.max_retries,
        )?),
        ProviderConfig::Vertex {
            project_id,
            location,
            model,
            endpoint,
            ..
        } => Arc::new(VertexProvider::new(
            project_id,
            location,
            model,
            endpoint.as_deref(),
            secret(config)?,
            config.dimensions()?,
            ctx.max_retries,
        )?),
        ProviderConfig::OpenAi {
            endpoint,
            model,
            dimensions,
        } => Arc::new(OpenAiProvider::new(
            endpoint,
            model,
            secret(config)?,
            config.dimensions()?,
            dimensions.is_some(),
            ctx.max_retries,
        )?),
        ProviderConfig::Multi { providers } => {
            let members = providers
                .iter()
                .map(|member| build_unchecked(member, credentials, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(MultiProvider::new(members)?)
        }
    };

    Ok(provider)
}

/// Validate each member of `config` independently.
pub fn validate_config(
    config: &ProviderConfig,
    credentials: &Credentials,
    ctx: &BuildContext,
) -> Vec<ValidationReport> {
    config
        .members()
        .into_iter()
        .map(|member| {
            let built = member
                .validate(credentials)
                .and_then(|_| build_unchecked(member, credentials, ctx));
            match built {
                Ok(provider) => provider.validate(),
                Err(e) => ValidationReport {
                    provider: member.kind().to_string(),
                    success: false,
                    message: e.to_string(),
                    resolved_url: None,
                    status_code: None,
                    tried_versions: vec![],
                    suggested_endpoint: None,
                },
            }
        })
        .collect()
}
