//! Any OpenAI-compatible `/embeddings` endpoint.

use serde::Deserialize;

use super::http::HttpTransport;
use super::{check_vectors, truncate_input, EmbeddingProvider, ProviderError};
use crate::config::ConfigError;

const PROVIDER: &str = "openai";
const MAX_BATCH_SIZE: usize = 64;

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

pub struct OpenAiProvider {
    url: String,
    model: String,
    api_key: String,
    dimensions: usize,
    /// Send `dimensions` in the request (text-embedding-3 models can shorten output)
    request_dimensions: bool,
    transport: HttpTransport,
}

impl OpenAiProvider {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: String,
        dimensions: usize,
        request_dimensions: bool,
        max_retries: u32,
    ) -> Result<Self, ConfigError> {
        let base = endpoint.trim().trim_end_matches('/');
        url::Url::parse(base)
            .map_err(|e| ConfigError::Invalid(format!("invalid endpoint `{endpoint}`: {e}")))?;
        let transport = HttpTransport::new(PROVIDER, max_retries)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(OpenAiProvider {
            url: format!("{base}/embeddings"),
            model: model.to_string(),
            api_key,
            dimensions,
            request_dimensions,
            transport,
        })
    }
}

impl EmbeddingProvider for OpenAiProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
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

        let mut body = serde_json::json!({
            "model": self.model,
            "input": inputs.iter().map(|t| truncate_input(t)).collect::<Vec<_>>(),
        });
        if self.request_dimensions {
            body["dimensions"] = serde_json::json!(self.dimensions);
        }
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];

        let reply = self.transport.post_json(&self.url, &headers, &body)?;
        let mut parsed: EmbeddingResponse = serde_json::from_value(reply)
            .map_err(|e| ProviderError::invalid(PROVIDER, e.to_string()))?;
        parsed.data.sort_by_key(|d| d.index);

        let vectors = parsed.data.into_iter().map(|d| d.embedding).collect();
        check_vectors(PROVIDER, inputs.len(), self.dimensions, vectors)
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joined_once() {
        let provider = OpenAiProvider::new(
            "http://localhost:11434/v1/",
            "nomic-embed-text",
            "k".into(),
            768,
            false,
            0,
        )
        .unwrap();
        assert_eq!(
            provider.endpoint().as_deref(),
            Some("http://localhost:11434/v1/embeddings")
        );
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(OpenAiProvider::new("::nope::", "m", "k".into(), 8, false, 0).is_err());
    }
}
