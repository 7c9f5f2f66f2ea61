//! Google Vertex AI text embeddings via the `:predict` endpoint.
//!
//! Authenticates with a bearer access token (for example the output of
//! `gcloud auth print-access-token`). Service-account key exchange is left to
//! the caller.

use serde_json::Value;

use super::http::HttpTransport;
use super::{check_vectors, truncate_input, EmbeddingProvider, ProviderError};
use crate::config::ConfigError;

const PROVIDER: &str = "vertex";
/// Instances per predict call accepted by every Vertex embedding model
const MAX_BATCH_SIZE: usize = 5;

pub struct VertexProvider {
    url: String,
    model: String,
    access_token: String,
    dimensions: usize,
    transport: HttpTransport,
}

pub(crate) fn default_url(project_id: &str, location: &str, model: &str) -> String {
    format!(
        "https://{location}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{location}/publishers/google/models/{model}:predict"
    )
}

/// Vectors live at `predictions[i].embeddings.values`; older models use
/// `embedding` instead of `embeddings`.
fn extract_values(prediction: &Value) -> Option<Vec<f32>> {
    let holder = prediction
        .get("embeddings")
        .or_else(|| prediction.get("embedding"))?;
    holder
        .get("values")?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

impl VertexProvider {
    pub fn new(
        project_id: &str,
        location: &str,
        model: &str,
        endpoint: Option<&str>,
        access_token: String,
        dimensions: usize,
        max_retries: u32,
    ) -> Result<Self, ConfigError> {
        let url = match endpoint.map(str::trim).filter(|e| !e.is_empty()) {
            Some(custom) => {
                url::Url::parse(custom).map_err(|e| {
                    ConfigError::Invalid(format!("invalid vertex endpoint `{custom}`: {e}"))
                })?;
                custom.to_string()
            }
            None => default_url(project_id, location, model),
        };
        let transport = HttpTransport::new(PROVIDER, max_retries)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(VertexProvider {
            url,
            model: model.to_string(),
            access_token,
            dimensions,
            transport,
        })
    }
}

impl EmbeddingProvider for VertexProvider {
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
        let mut vectors = Vec::with_capacity(inputs.len());
        for chunk in inputs.chunks(MAX_BATCH_SIZE) {
            let body = serde_json::json!({
                "instances": chunk
                    .iter()
                    .map(|text| serde_json::json!({ "content": truncate_input(text) }))
                    .collect::<Vec<_>>(),
            });
            let headers = [(
                "Authorization",
                format!("Bearer {}", self.access_token),
            )];
            let reply = self.transport.post_json(&self.url, &headers, &body)?;

            let predictions = reply
                .get("predictions")
                .and_then(Value::as_array)
                .ok_or_else(|| ProviderError::invalid(PROVIDER, "missing `predictions`"))?;
            for prediction in predictions {
                vectors.push(extract_values(prediction).ok_or_else(|| {
                    ProviderError::invalid(PROVIDER, "prediction without embedding values")
                })?);
            }
        }
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
    fn test_default_url() {
        assert_eq!(
            default_url("proj", "europe-west4", "text-embedding-004"),
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/proj/locations/europe-west4/publishers/google/models/text-embedding-004:predict"
        );
    }

    #[test]
    fn test_extract_values_both_shapes() {
        let current = serde_json::json!({"embeddings": {"values": [0.5, 1.0]}});
        let legacy = serde_json::json!({"embedding": {"values": [0.25]}});
        assert_eq!(extract_values(&current), Some(vec![0.5, 1.0]));
        assert_eq!(extract_values(&legacy), Some(vec![0.25]));
        assert_eq!(extract_values(&serde_json::json!({})), None);
    }

    #[test]
    fn test_endpoint_override_wins() {
        let provider = VertexProvider::new(
            "proj",
            "us-central1",
            "text-embedding-004",
            Some("http://127.0.0.1:9999/predict"),
            "token".into(),
            768,
            0,
        )
        .unwrap();
        assert_eq!(
            provider.endpoint().as_deref(),
            Some("http://127.0.0.1:9999/predict")
        );
    }
}
