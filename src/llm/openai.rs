//! OpenAI-compatible completion client.
//!
//! Speaks the `/chat/completions` wire format shared by OpenAI and the
//! self-hosted/compatible endpoints configured via `LLM_BASE_URL`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::llm::CompletionClient;

/// Maximum number of retry attempts for transient errors.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Configuration for an [`OpenAiClient`].
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key for authentication.
    pub api_key: String,
    /// Base URL, e.g. `https://api.openai.com/v1`. No trailing slash.
    pub base_url: String,
}

impl OpenAiConfig {
    /// Creates a new config with the given API key and base URL.
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

/// OpenAI-compatible completion client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiClient {
    /// Creates a new client with the given configuration.
    ///
    /// The HTTP client's own timeout is left unbounded; each call supplies
    /// its own per-request timeout, since node timeouts vary (20s/25s/12s).
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| AppError::llm(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Parses an API error response and returns (error, is_retryable).
    fn parse_error(status: reqwest::StatusCode, body: &str) -> (AppError, bool) {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return (
                AppError::llm("authentication failed, check LLM_API_KEY"),
                false,
            );
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return (AppError::llm("rate limited by completion provider"), true);
        }

        let is_retryable = status.is_server_error();

        if let Ok(error_response) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return (
                AppError::llm(format!("completion API error: {}", error_response.error.message)),
                is_retryable,
            );
        }

        (
            AppError::llm(format!("completion API error ({status}): {body}")),
            is_retryable,
        )
    }

    fn is_retryable_request_error(error: &reqwest::Error) -> bool {
        error.is_timeout() || error.is_connect()
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String> {
        let request = OpenAiRequest {
            model: model.to_string(),
            temperature,
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            stream: false,
        };

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!("completion request attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            let result = self
                .client
                .post(self.endpoint())
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .header("Content-Type", "application/json")
                .json(&request)
                .timeout(timeout)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .map_err(|e| AppError::llm(format!("failed to read response: {e}")))?;

                    if status.is_success() {
                        let parsed: OpenAiResponse = serde_json::from_str(&body)
                            .map_err(|e| AppError::llm(format!("failed to parse response: {e}")))?;

                        let choice = parsed
                            .choices
                            .into_iter()
                            .next()
                            .ok_or_else(|| AppError::llm("no choices in completion response"))?;

                        return Ok(choice.message.content.unwrap_or_default());
                    }

                    let (error, is_retryable) = Self::parse_error(status, &body);
                    last_error = Some(error);

                    if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                        break;
                    }

                    warn!("completion request failed (attempt {}), retrying in {:?}: {}", attempt, delay, status);
                }
                Err(e) => {
                    let is_retryable = Self::is_retryable_request_error(&e);
                    let error = if e.is_timeout() {
                        AppError::llm("completion request timed out")
                    } else if e.is_connect() {
                        AppError::llm("failed to connect to completion endpoint")
                    } else {
                        AppError::llm(format!("completion request failed: {e}"))
                    };
                    last_error = Some(error);

                    if !is_retryable || attempt >= MAX_RETRY_ATTEMPTS {
                        break;
                    }

                    warn!("completion request error (attempt {}), retrying in {:?}", attempt, delay);
                }
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(last_error.unwrap_or_else(|| AppError::llm("completion request failed with no error detail")))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    temperature: f32,
    messages: Vec<OpenAiMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let client = OpenAiClient::new(OpenAiConfig::new("key", "https://api.openai.com/v1/")).unwrap();
        assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_parse_error_unauthorized_is_not_retryable() {
        let (err, retryable) = OpenAiClient::parse_error(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(!retryable);
        assert_eq!(err.reason_code(), "llm_error");
    }

    #[test]
    fn test_parse_error_rate_limited_is_retryable() {
        let (_, retryable) = OpenAiClient::parse_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(retryable);
    }

    #[test]
    fn test_parse_error_server_error_is_retryable() {
        let (_, retryable) = OpenAiClient::parse_error(reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(retryable);
    }
}
