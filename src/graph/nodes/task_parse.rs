//! Task parse: extract entities/dimensions/metrics/filters/operation.

use std::time::Duration;

use crate::error::{AppError, Result};
use crate::graph::prompts::{build_task_parse_user_prompt, TASK_PARSE_SYSTEM_PROMPT};
use crate::graph::state::{Entity, Filter, Intent, Operation, TaskParseResult, TimeRange};
use crate::llm::{extract_json_object, CompletionClient, NODE_TEMPERATURE};
use crate::schema_kb::SchemaKnowledge;

const TIMEOUT: Duration = Duration::from_secs(25);
const ALLOWED_OPS: &[&str] = &["=", "!=", "<", ">", "<=", ">=", "like", "in", "not in", "between"];

/// Parses a business query into a structured task.
///
/// Precondition: the caller only invokes this after intent recognition
/// resolved to `business_query`. `intent` on the result is always coerced to
/// `business_query`, matching that precondition.
pub async fn run(
    llm: &dyn CompletionClient,
    kb: &SchemaKnowledge,
    query: &str,
    model: &str,
) -> Result<TaskParseResult> {
    let whitelist = kb.whitelist_sorted();
    let user_prompt = build_task_parse_user_prompt(query, &whitelist, kb.alias_pairs());

    let raw = llm
        .complete(TASK_PARSE_SYSTEM_PROMPT, &user_prompt, model, NODE_TEMPERATURE, TIMEOUT)
        .await?;

    let parsed = extract_json_object(&raw)
        .map_err(|e| AppError::node_contract("task_parse", format!("non-JSON response: {e}")))?;

    let confidence = parsed
        .get("confidence")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| AppError::node_contract("task_parse", "missing confidence"))?;

    let entities = parsed
        .get("entities")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let entity_type = item.get("type")?.as_str()?.trim().to_string();
                    let value = item.get("value")?.as_str()?.trim().to_string();
                    if entity_type.is_empty() || value.is_empty() {
                        return None;
                    }
                    Some(Entity { entity_type, value })
                })
                .collect()
        })
        .unwrap_or_default();

    let dimensions = string_list(parsed.get("dimensions"));
    let metrics = string_list(parsed.get("metrics"));

    let filters = parsed
        .get("filters")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let field = item.get("field")?.as_str()?.trim().to_string();
                    let op = item.get("op")?.as_str()?.trim().to_lowercase();
                    let value = item.get("value").cloned()?;
                    if !kb.is_whitelisted(&field) || !ALLOWED_OPS.contains(&op.as_str()) {
                        return None;
                    }
                    Some(Filter { field, op, value })
                })
                .collect()
        })
        .unwrap_or_default();

    let time_range = parsed
        .get("time_range")
        .map(|tr| TimeRange {
            start: tr.get("start").and_then(|v| v.as_str()).map(str::to_string),
            end: tr.get("end").and_then(|v| v.as_str()).map(str::to_string),
        })
        .unwrap_or_default();

    let operation = match parsed.get("operation").and_then(|v| v.as_str()) {
        Some("detail") => Operation::Detail,
        Some("ranking") => Operation::Ranking,
        Some("trend") => Operation::Trend,
        _ => Operation::Aggregate,
    };

    Ok(TaskParseResult {
        intent: Intent::BusinessQuery,
        entities,
        dimensions,
        metrics,
        filters,
        time_range,
        operation,
        confidence,
    })
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockCompletionClient;
    use crate::schema_kb::{KbColumn, KbTable, SchemaKb};

    fn kb() -> SchemaKnowledge {
        SchemaKnowledge::from_kb(SchemaKb {
            tables: vec![
                KbTable {
                    name: "student".to_string(),
                    description: "学生信息".to_string(),
                    aliases: vec![],
                    columns: vec![
                        KbColumn {
                            name: "enroll_year".to_string(),
                            description: "入学年份".to_string(),
                            aliases: vec![],
                        },
                        KbColumn {
                            name: "gender".to_string(),
                            description: "性别".to_string(),
                            aliases: vec![],
                        },
                    ],
                },
                KbTable {
                    name: "class".to_string(),
                    description: "班级信息".to_string(),
                    aliases: vec![],
                    columns: vec![KbColumn {
                        name: "class_name".to_string(),
                        description: "班级名称".to_string(),
                        aliases: vec![],
                    }],
                },
            ],
        })
    }

    #[tokio::test]
    async fn test_filters_outside_whitelist_are_dropped() {
        let kb = kb();
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"entities":[],"dimensions":["class.class_name"],"metrics":["count"],
               "filters":[{"field":"student.enroll_year","op":"=","value":2022},
                          {"field":"student.grade_year","op":"=","value":2022}],
               "time_range":{"start":null,"end":null},"operation":"aggregate","confidence":0.9}"#,
        );
        let result = run(&llm, &kb, "统计22级各班人数", "gpt-4o-mini").await.unwrap();
        assert_eq!(result.filters.len(), 1);
        assert_eq!(result.filters[0].field, "student.enroll_year");
    }

    #[tokio::test]
    async fn test_intent_is_coerced_to_business_query() {
        let kb = kb();
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"entities":[],"dimensions":[],"metrics":[],"filters":[],
               "time_range":{},"operation":"detail","confidence":0.8}"#,
        );
        let result = run(&llm, &kb, "列出所有学生", "gpt-4o-mini").await.unwrap();
        assert_eq!(result.intent, Intent::BusinessQuery);
        assert_eq!(result.operation, Operation::Detail);
    }

    #[tokio::test]
    async fn test_invalid_op_is_dropped() {
        let kb = kb();
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"entities":[],"dimensions":[],"metrics":[],
               "filters":[{"field":"student.gender","op":"weird_op","value":"男"}],
               "time_range":{},"operation":"aggregate","confidence":0.8}"#,
        );
        let result = run(&llm, &kb, "男生人数", "gpt-4o-mini").await.unwrap();
        assert!(result.filters.is_empty());
    }
}
