//! Mock completion client for testing the graph without a real LLM.
//!
//! Responses are queued up front and handed out in order; a client with no
//! queued responses left falls back to pattern matching on the user prompt,
//! which is enough to exercise the node-level JSON contracts in tests.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::llm::CompletionClient;

/// Mock completion client that returns canned JSON responses.
///
/// Used for unit and integration tests exercising the graph without making
/// real API calls.
#[derive(Debug, Default)]
pub struct MockCompletionClient {
    /// Responses returned in FIFO order, one per call to `complete`.
    queued: Mutex<Vec<String>>,
    /// Fallback pattern mappings (substring of user prompt -> response).
    patterns: Vec<(String, String)>,
}

impl MockCompletionClient {
    /// Creates a mock client with no queued responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a JSON response string to be returned on the next call.
    pub fn with_queued_response(mut self, response: impl Into<String>) -> Self {
        self.queued.get_mut().unwrap().push(response.into());
        self
    }

    /// Adds a fallback pattern mapping used once the queue is exhausted.
    ///
    /// When the user prompt contains `pattern`, the mock returns `response`.
    pub fn with_pattern(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.patterns.push((pattern.into(), response.into()));
        self
    }

    fn fallback_response(&self, user_prompt: &str) -> Result<String> {
        let lower = user_prompt.to_lowercase();

        for (pattern, response) in &self.patterns {
            if lower.contains(&pattern.to_lowercase()) {
                return Ok(response.clone());
            }
        }

        Err(AppError::llm("mock completion client has no queued or matching response"))
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _model: &str,
        _temperature: f32,
        _timeout: Duration,
    ) -> Result<String> {
        let next = {
            let mut queued = self.queued.lock().unwrap();
            if queued.is_empty() {
                None
            } else {
                Some(queued.remove(0))
            }
        };

        match next {
            Some(response) => Ok(response),
            None => self.fallback_response(user_prompt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_responses_are_returned_in_order() {
        let client = MockCompletionClient::new()
            .with_queued_response(r#"{"a":1}"#)
            .with_queued_response(r#"{"a":2}"#);

        let first = client
            .complete("sys", "user", "model", 0.1, Duration::from_secs(1))
            .await
            .unwrap();
        let second = client
            .complete("sys", "user", "model", 0.1, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first, r#"{"a":1}"#);
        assert_eq!(second, r#"{"a":2}"#);
    }

    #[tokio::test]
    async fn test_pattern_fallback_after_queue_exhausted() {
        let client = MockCompletionClient::new().with_pattern("how many students", r#"{"intent":"business_query"}"#);

        let response = client
            .complete("sys", "how many students are there", "model", 0.1, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response, r#"{"intent":"business_query"}"#);
    }

    #[tokio::test]
    async fn test_no_match_is_error() {
        let client = MockCompletionClient::new();
        let result = client
            .complete("sys", "anything", "model", 0.1, Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }
}
