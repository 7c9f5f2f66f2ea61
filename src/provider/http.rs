//! Blocking HTTP transport shared by the remote providers.
//!
//! Retries 429, 5xx and network failures with exponential backoff.
//! Authentication failures and other 4xx responses are returned at once.

use std::time::Duration;

use rand::Rng;
use reqwest::blocking::Client;
use reqwest::StatusCode;

use super::ProviderError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);
/// Response text kept in error messages
const MAX_ERROR_BODY: usize = 300;

pub(crate) struct HttpTransport {
    client: Client,
    provider: &'static str,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(provider: &'static str, max_retries: u32) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network {
                provider: provider.to_string(),
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(HttpTransport {
            client,
            provider,
            max_retries,
        })
    }

    /// POST a JSON body and return the parsed JSON reply of a 2xx response.
    pub fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            let (error, retry_after) = match request.send() {
                Err(e) => (
                    ProviderError::Network {
                        provider: self.provider.to_string(),
                        message: e.to_string(),
                    },
                    None,
                ),
                Ok(response) => {
                    let status = response.status();
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let text = response.text().unwrap_or_default();

                    if status.is_success() {
                        return serde_json::from_str(&text).map_err(|e| {
                            ProviderError::invalid(self.provider, format!("malformed json: {e}"))
                        });
                    }

                    let error = self.status_error(status, &text, attempt + 1);
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    (error, retry_after)
                }
            };

            if attempt >= self.max_retries {
                return Err(error);
            }

            let delay = retry_after
                .unwrap_or_else(|| backoff(attempt))
                .min(MAX_DELAY);
            log::warn!(
                "provider={} attempt={}/{} retrying in {}ms: {error}",
                self.provider,
                attempt + 1,
                self.max_retries + 1,
                delay.as_millis()
            );
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    fn status_error(&self, status: StatusCode, text: &str, attempts: u32) -> ProviderError {
        let provider = self.provider.to_string();
        let message = clip(text);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication {
                provider,
                status: status.as_u16(),
                message,
            },
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { provider, attempts },
            _ => ProviderError::Http {
                provider,
                status: status.as_u16(),
                message,
            },
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// 500ms, 1s, 2s, ... plus up to 250ms of jitter
fn backoff(attempt: u32) -> Duration {
    let base = BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt));
    base + Duration::from_millis(rand::rng().random_range(0..250))
}

fn clip(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_backoff_grows() {
        assert!(backoff(0) < Duration::from_millis(750));
        assert!(backoff(2) >= Duration::from_secs(2));
    }

    #[test]
    fn test_clip_long_body() {
        let body = "x".repeat(1000);
        assert_eq!(clip(&body).len(), MAX_ERROR_BODY + 3);
    }

    #[test]
    fn test_auth_error_classified() {
        let transport = HttpTransport::new("azure", 0).unwrap();
        let err = transport.status_error(StatusCode::UNAUTHORIZED, "bad key", 1);
        assert!(err.is_auth());
        assert_eq!(err.status_code(), Some(401));
    }
}
