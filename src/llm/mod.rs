//! LLM integration for the query assistant.
//!
//! The graph nodes do not talk to a provider SDK directly. They go through a
//! single narrow port: `(system_prompt, user_prompt) -> JSON object`, always
//! called at temperature 0.1 with a node-specific timeout. This module
//! defines that port and one OpenAI-compatible implementation of it.

pub mod mock;
pub mod openai;

pub use mock::MockCompletionClient;
pub use openai::{OpenAiClient, OpenAiConfig};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Fixed sampling temperature used for every completion call in the graph.
pub const NODE_TEMPERATURE: f32 = 0.1;

/// Trait for the completion port every graph node calls through.
///
/// Implementations are responsible for the HTTP/transport concerns only;
/// JSON-object extraction and validation of the response shape is the
/// caller's job (each node validates its own contract).
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Requests a completion for the given system/user prompt pair.
    ///
    /// Returns the raw response text. Callers extract the first top-level
    /// JSON object from it with [`extract_json_object`].
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String>;
}

/// Extracts the first top-level JSON object from `text`, tolerant of
/// surrounding prose (some models wrap JSON in a code fence or a sentence).
///
/// Scans for the first `{` and returns the substring up to its matching
/// closing `}`, tracking string literals and escapes so braces inside
/// quoted values don't confuse the depth count.
pub fn extract_json_object(text: &str) -> Result<serde_json::Value> {
    let bytes = text.as_bytes();
    let start = text
        .find('{')
        .ok_or_else(|| AppError::llm("response contains no JSON object"))?;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end.ok_or_else(|| AppError::llm("response contains an unterminated JSON object"))?;
    let candidate = &text[start..=end];

    serde_json::from_str(candidate)
        .map_err(|e| AppError::llm(format!("failed to parse JSON object from response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_object() {
        let value = extract_json_object(r#"{"intent":"chat","confidence":0.9}"#).unwrap();
        assert_eq!(value["intent"], "chat");
    }

    #[test]
    fn test_extract_object_with_surrounding_prose() {
        let text = "Sure, here is the result:\n```json\n{\"a\": 1}\n```\nHope that helps.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_object_with_nested_braces_in_string() {
        let text = r#"{"sql": "SELECT '{not a brace}' AS x"}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["sql"], "SELECT '{not a brace}' AS x");
    }

    #[test]
    fn test_extract_no_object_is_error() {
        assert!(extract_json_object("no json here").is_err());
    }

    #[test]
    fn test_extract_unterminated_object_is_error() {
        assert!(extract_json_object(r#"{"a": 1"#).is_err());
    }
}
