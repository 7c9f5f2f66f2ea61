//! Per-index provider configuration and the separate credential store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::semantic::cache::EmbeddingSpace;
use crate::storage::{BackendLocal, StorageManager};

use super::local;

pub const PROVIDER_FILE: &str = "provider.yaml";
pub const CREDENTIALS_FILE: &str = "credentials.json";

pub const DEFAULT_LOCAL_MODEL: &str = "bge-small-en-v1.5";
const DEFAULT_HASH_DIMENSIONS: usize = 384;
const DEFAULT_VERTEX_LOCATION: &str = "us-central1";
const DEFAULT_VERTEX_MODEL: &str = "text-embedding-004";
const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";

fn default_local_model() -> String {
    DEFAULT_LOCAL_MODEL.to_string()
}

fn default_hash_dimensions() -> usize {
    DEFAULT_HASH_DIMENSIONS
}

fn default_vertex_location() -> String {
    DEFAULT_VERTEX_LOCATION.to_string()
}

fn default_vertex_model() -> String {
    DEFAULT_VERTEX_MODEL.to_string()
}

fn default_openai_endpoint() -> String {
    DEFAULT_OPENAI_ENDPOINT.to_string()
}

/// Which backend an index embeds with. Secrets never live here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Local {
        #[serde(default = "default_local_model")]
        model: String,
    },
    Hashing {
        #[serde(default = "default_hash_dimensions")]
        dimensions: usize,
    },
    Azure {
        /// Resource endpoint, e.g. https://myres.openai.azure.com
        endpoint: String,
        deployment: String,
        #[serde(default)]
        api_version: Option<String>,
        #[serde(default)]
        dimensions: Option<usize>,
    },
    Vertex {
        project_id: String,
        #[serde(default = "default_vertex_location")]
        location: String,
        #[serde(default = "default_vertex_model")]
        model: String,
        /// Full predict URL, replacing the regional default
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        dimensions: Option<usize>,
    },
    #[serde(rename = "openai")]
    OpenAi {
        #[serde(default = "default_openai_endpoint")]
        endpoint: String,
        model: String,
        #[serde(default)]
        dimensions: Option<usize>,
    },
    Multi {
        providers: Vec<ProviderConfig>,
    },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Local {
            model: default_local_model(),
        }
    }
}

fn require(value: &str, provider: &'static str, field: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField { provider, field });
    }
    Ok(())
}

impl ProviderConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::Local { .. } => "local",
            ProviderConfig::Hashing { .. } => "hashing",
            ProviderConfig::Azure { .. } => "azure",
            ProviderConfig::Vertex { .. } => "vertex",
            ProviderConfig::OpenAi { .. } => "openai",
            ProviderConfig::Multi { .. } => "multi",
        }
    }

    pub fn model_id(&self) -> String {
        match self {
            ProviderConfig::Local { model } => model.to_lowercase(),
            ProviderConfig::Hashing { dimensions } => format!("hash-{dimensions}"),
            ProviderConfig::Azure { deployment, .. } => deployment.clone(),
            ProviderConfig::Vertex { model, .. } => model.clone(),
            ProviderConfig::OpenAi { model, .. } => model.clone(),
            ProviderConfig::Multi { providers } => providers
                .iter()
                .map(|p| format!("{}:{}", p.kind(), p.model_id()))
                .collect::<Vec<_>>()
                .join("|"),
        }
    }

    /// Declared output width. Remote defaults follow the vendor's published sizes.
    pub fn dimensions(&self) -> Result<usize, ConfigError> {
        match self {
            ProviderConfig::Local { model } => local::dimensions_for(model).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "unknown local model `{model}`; supported: {}",
                    local::SUPPORTED_MODELS.join(", ")
                ))
            }),
            ProviderConfig::Hashing { dimensions } => Ok(*dimensions),
            ProviderConfig::Azure {
                deployment,
                dimensions,
                ..
            } => Ok(dimensions.unwrap_or_else(|| openai_default_dimensions(deployment))),
            ProviderConfig::Vertex { dimensions, .. } => Ok(dimensions.unwrap_or(768)),
            ProviderConfig::OpenAi {
                model, dimensions, ..
            } => Ok(dimensions.unwrap_or_else(|| openai_default_dimensions(model))),
            ProviderConfig::Multi { providers } => {
                let mut expected = None;
                for member in providers {
                    let got = member.dimensions()?;
                    match expected {
                        None => expected = Some(got),
                        Some(expected) if expected != got => {
                            return Err(ConfigError::DimensionMismatch { expected, got })
                        }
                        Some(_) => {}
                    }
                }
                expected.ok_or_else(|| ConfigError::Invalid("multi provider has no members".into()))
            }
        }
    }

    pub fn space(&self) -> Result<EmbeddingSpace, ConfigError> {
        Ok(EmbeddingSpace::new(
            self.kind(),
            self.model_id(),
            self.dimensions()?,
        ))
    }

    /// Key under which this entry's secret lives in the credential store.
    pub fn credential_key(&self) -> Option<String> {
        match self {
            ProviderConfig::Azure {
                endpoint,
                deployment,
                ..
            } => Some(format!(
                "azure:{}/{}",
                endpoint.trim_end_matches('/'),
                deployment
            )),
            ProviderConfig::Vertex {
                project_id,
                location,
                ..
            } => Some(format!("vertex:{project_id}/{location}")),
            ProviderConfig::OpenAi { endpoint, .. } => {
                Some(format!("openai:{}", endpoint.trim_end_matches('/')))
            }
            _ => None,
        }
    }

    /// Single entries yield themselves; `multi` yields its members.
    pub fn members(&self) -> Vec<&ProviderConfig> {
        match self {
            ProviderConfig::Multi { providers } => providers.iter().collect(),
            other => vec![other],
        }
    }

    /// Spaces each member writes into, in fallback order.
    pub fn member_spaces(&self) -> Result<Vec<EmbeddingSpace>, ConfigError> {
        self.members().into_iter().map(|m| m.space()).collect()
    }

    /// Reject incomplete configuration before any work starts.
    pub fn validate(&self, credentials: &Credentials) -> Result<(), ConfigError> {
        match self {
            ProviderConfig::Local { model } => {
                require(model, "local", "model")?;
            }
            ProviderConfig::Hashing { dimensions } => {
                if *dimensions == 0 || *dimensions > u16::MAX as usize {
                    return Err(ConfigError::Invalid(format!(
                        "hashing dimensions must be between 1 and {}, got {dimensions}",
                        u16::MAX
                    )));
                }
            }
            ProviderConfig::Azure {
                endpoint,
                deployment,
                ..
            } => {
                require(endpoint, "azure", "endpoint")?;
                require(deployment, "azure", "deployment")?;
            }
            ProviderConfig::Vertex {
                project_id,
                location,
                model,
                ..
            } => {
                require(project_id, "vertex", "project_id")?;
                require(location, "vertex", "location")?;
                require(model, "vertex", "model")?;
            }
            ProviderConfig::OpenAi {
                endpoint, model, ..
            } => {
                require(endpoint, "openai", "endpoint")?;
                require(model, "openai", "model")?;
            }
            ProviderConfig::Multi { providers } => {
                if providers.is_empty() {
                    return Err(ConfigError::MissingField {
                        provider: "multi",
                        field: "providers",
                    });
                }
                for member in providers {
                    if matches!(member, ProviderConfig::Multi { .. }) {
                        return Err(ConfigError::Invalid(
                            "multi providers cannot be nested".into(),
                        ));
                    }
                    member.validate(credentials)?;
                }
            }
        }

        if let Some(key) = self.credential_key() {
            if !credentials.is_configured(&key) {
                return Err(ConfigError::MissingCredential(key));
            }
        }

        // also catches unknown local models and mixed-width multi members
        let dimensions = self.dimensions()?;
        if dimensions == 0 || dimensions > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "unsupported embedding width {dimensions}"
            )));
        }

        Ok(())
    }

    pub fn load(storage: &BackendLocal) -> Result<Self, ConfigError> {
        if !storage.exists(PROVIDER_FILE) {
            return Ok(Self::default());
        }
        let raw = String::from_utf8(storage.read(PROVIDER_FILE)?)
            .map_err(|_| ConfigError::Invalid(format!("{PROVIDER_FILE} is not valid utf8")))?;
        Ok(serde_yml::from_str(&raw)?)
    }

    pub fn save(&self, storage: &BackendLocal) -> Result<(), ConfigError> {
        storage.write(PROVIDER_FILE, serde_yml::to_string(self)?.as_bytes())?;
        Ok(())
    }
}

fn openai_default_dimensions(model: &str) -> usize {
    if model.contains("3-large") {
        3072
    } else {
        1536
    }
}

/// Secrets for remote providers, keyed by [`ProviderConfig::credential_key`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(flatten)]
    secrets: BTreeMap<String, String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.secrets.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

impl Credentials {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.secrets
            .get(key)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn is_configured(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// An empty secret keeps whatever is already stored.
    pub fn set(&mut self, key: impl Into<String>, secret: &str) {
        let secret = secret.trim();
        if secret.is_empty() {
            return;
        }
        self.secrets.insert(key.into(), secret.to_string());
    }

    pub fn load(storage: &BackendLocal) -> Result<Self, ConfigError> {
        Ok(storage
            .read_json::<Credentials>(CREDENTIALS_FILE)?
            .unwrap_or_default())
    }

    pub fn save(&self, storage: &BackendLocal) -> Result<(), ConfigError> {
        storage.write_json(CREDENTIALS_FILE, self)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                storage.path_of(CREDENTIALS_FILE),
                std::fs::Permissions::from_mode(0o600),
            )?;
        }

        Ok(())
    }
}

/// What a caller may see of a provider entry: never the secret itself.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderView {
    pub kind: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    pub configured: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ProviderView>,
}

pub fn describe(config: &ProviderConfig, credentials: &Credentials) -> ProviderView {
    let endpoint = match config {
        ProviderConfig::Azure { endpoint, .. } | ProviderConfig::OpenAi { endpoint, .. } => {
            Some(endpoint.clone())
        }
        ProviderConfig::Vertex { endpoint, .. } => endpoint.clone(),
        _ => None,
    };

    let members: Vec<ProviderView> = match config {
        ProviderConfig::Multi { providers } => {
            providers.iter().map(|p| describe(p, credentials)).collect()
        }
        _ => vec![],
    };

    let configured = match config {
        ProviderConfig::Multi { .. } => !members.is_empty() && members.iter().all(|m| m.configured),
        other => other
            .credential_key()
            .map(|key| credentials.is_configured(&key))
            .unwrap_or(true),
    };

    ProviderView {
        kind: config.kind().to_string(),
        model: config.model_id(),
        endpoint,
        dimensions: config.dimensions().ok(),
        configured,
        members,
    }
}
