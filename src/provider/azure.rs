//! Azure OpenAI embeddings.

use std::sync::Mutex;

use serde::Deserialize;

use super::http::HttpTransport;
use super::{check_vectors, truncate_input, EmbeddingProvider, ProviderError, ValidationReport};
use crate::config::ConfigError;
use crate::semantic::cache::EmbeddingSpace;

const PROVIDER: &str = "azure";
const DEFAULT_API_VERSION: &str = "2024-02-01";
const FALLBACK_API_VERSIONS: &[&str] = &["2024-02-01", "2023-10-01", "2023-05-15"];
const MAX_BATCH_SIZE: usize = 16;
/// Marks stored documents; queries go out bare
const PASSAGE_PREFIX: &str = "passage: ";

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

pub struct AzureProvider {
    endpoint: String,
    base: String,
    deployment: String,
    /// Version that last worked; sticky after a fallback
    api_version: Mutex<String>,
    api_key: String,
    dimensions: usize,
    transport: HttpTransport,
}

/// Reduce an endpoint to `scheme://host[:port]` so pasted portal paths do not
/// end up doubled in the request URL.
pub(crate) fn resolve_base(endpoint: &str) -> Result<String, ConfigError> {
    let url = url::Url::parse(endpoint.trim())
        .map_err(|e| ConfigError::Invalid(format!("invalid azure endpoint `{endpoint}`: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::Invalid(format!("azure endpoint `{endpoint}` has no host")))?;
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    Ok(format!("{}://{}{}", url.scheme(), host, port))
}

pub(crate) fn embeddings_url(base: &str, deployment: &str, api_version: &str) -> String {
    format!("{base}/openai/deployments/{deployment}/embeddings?api-version={api_version}")
}

/// AI Foundry project hosts serve embeddings from the matching
/// cognitiveservices resource; API paths point back at the bare host.
pub(crate) fn suggested_endpoint(endpoint: &str) -> Option<String> {
    let url = url::Url::parse(endpoint.trim()).ok()?;
    let host = url.host_str()?;
    if host.contains("services.ai.azure.com") {
        let prefix = host.split('.').next()?;
        return Some(format!("https://{prefix}.cognitiveservices.azure.com"));
    }
    if url.path().contains("/api/") {
        return Some(format!("https://{host}"));
    }
    None
}

pub(crate) fn request_body(inputs: &[String], prefix: &str) -> serde_json::Value {
    serde_json::json!({
        "input": inputs
            .iter()
            .map(|text| format!("{prefix}{}", truncate_input(text)))
            .collect::<Vec<_>>(),
    })
}

fn unsupported_version(err: &ProviderError) -> bool {
    match err {
        ProviderError::Http { message, .. } => message
            .to_lowercase()
            .contains("api version not supported"),
        _ => false,
    }
}

impl AzureProvider {
    pub fn new(
        endpoint: &str,
        deployment: &str,
        api_version: Option<&str>,
        api_key: String,
        dimensions: usize,
        max_retries: u32,
    ) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(PROVIDER, max_retries)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(AzureProvider {
            endpoint: endpoint.to_string(),
            base: resolve_base(endpoint)?,
            deployment: deployment.to_string(),
            api_version: Mutex::new(api_version.unwrap_or(DEFAULT_API_VERSION).to_string()),
            api_key,
            dimensions,
            transport,
        })
    }

    fn current_version(&self) -> String {
        self.api_version
            .lock()
            .map(|v| v.clone())
            .unwrap_or_else(|_| DEFAULT_API_VERSION.to_string())
    }

    /// Configured version first, then the known fallbacks, without repeats.
    fn candidate_versions(&self) -> Vec<String> {
        let mut versions = vec![self.current_version()];
        for v in FALLBACK_API_VERSIONS {
            if !versions.iter().any(|known| known == v) {
                versions.push(v.to_string());
            }
        }
        versions
    }

    /// Try each api-version until one is accepted. Returns the vectors plus
    /// the versions tried and the last URL used.
    fn request(
        &self,
        inputs: &[String],
        prefix: &str,
    ) -> (Result<Vec<Vec<f32>>, ProviderError>, Vec<String>, String) {
        let body = request_body(inputs, prefix);
        let headers = [("api-key", self.api_key.clone())];

        let mut tried = vec![];
        let mut last_url = String::new();
        let mut last_err = None;

        for version in self.candidate_versions() {
            let url = embeddings_url(&self.base, &self.deployment, &version);
            tried.push(version.clone());
            last_url = url.clone();

            match self.transport.post_json(&url, &headers, &body) {
                Ok(reply) => {
                    if let Ok(mut current) = self.api_version.lock() {
                        if *current != version {
                            log::info!("provider=azure switched api-version to {version}");
                            *current = version;
                        }
                    }
                    return (self.parse(reply, inputs.len()), tried, url);
                }
                Err(e) if unsupported_version(&e) => {
                    log::warn!("provider=azure api-version {version} not supported");
                    last_err = Some(e);
                }
                Err(e) => return (Err(e), tried, url),
            }
        }

        let err = last_err.unwrap_or_else(|| {
            ProviderError::invalid(PROVIDER, "no api versions left to try")
        });
        (Err(err), tried, last_url)
    }

    fn parse(
        &self,
        reply: serde_json::Value,
        inputs: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut parsed: EmbeddingResponse = serde_json::from_value(reply)
            .map_err(|e| ProviderError::invalid(PROVIDER, e.to_string()))?;
        parsed.data.sort_by_key(|d| d.index);
        let vectors = parsed.data.into_iter().map(|d| d.embedding).collect();
        check_vectors(PROVIDER, inputs, self.dimensions, vectors)
    }
}

impl EmbeddingProvider for AzureProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.deployment
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
        self.request(inputs, PASSAGE_PREFIX).0
    }

    fn embed_query(&self, space: &EmbeddingSpace, query: &str) -> Result<Vec<f32>, ProviderError> {
        if *space != self.space() {
            return Err(ProviderError::SpaceUnavailable {
                provider: PROVIDER.to_string(),
                space: space.label(),
            });
        }
        self.request(&[query.to_string()], "")
            .0?
            .pop()
            .ok_or_else(|| ProviderError::invalid(PROVIDER, "no vector for the query"))
    }

    fn endpoint(&self) -> Option<String> {
        Some(embeddings_url(
            &self.base,
            &self.deployment,
            &self.current_version(),
        ))
    }

    fn validate(&self) -> ValidationReport {
        let (result, tried, url) = self.request(&["connection test".to_string()], PASSAGE_PREFIX);
        let mut report = ValidationReport::from_result(PROVIDER, Some(url), &result);
        report.tried_versions = tried;
        report.suggested_endpoint = suggested_endpoint(&self.endpoint);
        report
    }
}
