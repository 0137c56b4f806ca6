//! Intent recognition: chat vs business_query, with follow-up merging.

use std::time::Duration;

use crate::error::{AppError, Result};
use crate::graph::prompts::{build_intent_user_prompt, INTENT_SYSTEM_PROMPT};
use crate::graph::state::{Intent, IntentResult};
use crate::llm::{extract_json_object, CompletionClient, NODE_TEMPERATURE};

const TIMEOUT: Duration = Duration::from_secs(20);

/// Runs intent recognition against the completion port.
///
/// `confidence < threshold` coerces `intent` to `chat`, per the intent
/// coercion invariant; every other validation failure is a fatal node error.
pub async fn run(
    llm: &dyn CompletionClient,
    message: &str,
    history_user_messages: &[String],
    threshold: f64,
    model: &str,
) -> Result<IntentResult> {
    let user_prompt = build_intent_user_prompt(message, history_user_messages);

    let raw = llm
        .complete(INTENT_SYSTEM_PROMPT, &user_prompt, model, NODE_TEMPERATURE, TIMEOUT)
        .await?;

    let parsed = extract_json_object(&raw)
        .map_err(|e| AppError::node_contract("intent_recognition", format!("non-JSON response: {e}")))?;

    let intent_str = parsed
        .get("intent")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::node_contract("intent_recognition", "missing intent"))?;
    let intent = match intent_str {
        "chat" => Intent::Chat,
        "business_query" => Intent::BusinessQuery,
        other => {
            return Err(AppError::node_contract(
                "intent_recognition",
                format!("invalid intent value: {other}"),
            ))
        }
    };

    let is_followup = parsed.get("is_followup").and_then(|v| v.as_bool()).unwrap_or(false);

    let confidence = parsed
        .get("confidence")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| AppError::node_contract("intent_recognition", "missing confidence"))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(AppError::node_contract("intent_recognition", "confidence out of [0,1]"));
    }

    let merged_query = parsed
        .get("merged_query")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::node_contract("intent_recognition", "missing or empty merged_query"))?
        .to_string();

    let rewritten_query = parsed
        .get("rewritten_query")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&merged_query)
        .to_string();

    let coerced_intent = if confidence < threshold { Intent::Chat } else { intent };

    Ok(IntentResult {
        intent: coerced_intent,
        is_followup,
        confidence,
        merged_query,
        rewritten_query,
        threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockCompletionClient;

    #[tokio::test]
    async fn test_business_query_above_threshold() {
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"intent":"business_query","is_followup":false,"confidence":0.9,"merged_query":"统计22级男生各班人数","rewritten_query":"统计22级男生各班人数"}"#,
        );
        let result = run(&llm, "统计22级男生各班人数", &[], 0.7, "gpt-4o-mini").await.unwrap();
        assert_eq!(result.intent, Intent::BusinessQuery);
        assert_eq!(result.merged_query, "统计22级男生各班人数");
    }

    #[tokio::test]
    async fn test_confidence_below_threshold_coerces_to_chat() {
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"intent":"business_query","is_followup":false,"confidence":0.5,"merged_query":"随便问问","rewritten_query":"随便问问"}"#,
        );
        let result = run(&llm, "随便问问", &[], 0.7, "gpt-4o-mini").await.unwrap();
        assert_eq!(result.intent, Intent::Chat);
    }

    #[tokio::test]
    async fn test_missing_field_is_node_contract_error() {
        let llm = MockCompletionClient::new().with_queued_response(r#"{"intent":"chat"}"#);
        let result = run(&llm, "hi", &[], 0.7, "gpt-4o-mini").await;
        assert!(matches!(result, Err(AppError::NodeContract { .. })));
    }

    #[tokio::test]
    async fn test_non_json_response_is_node_contract_error() {
        let llm = MockCompletionClient::new().with_queued_response("not json at all");
        let result = run(&llm, "hi", &[], 0.7, "gpt-4o-mini").await;
        assert!(result.is_err());
    }
}
