//! Result return: compute the final status, de-duplicate student rows,
//! build a human summary, and persist the turn.

use std::time::Duration;

use serde_json::{Map, Value as Json};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::export::write_csv;
use crate::graph::prompts::{build_result_summary_user_prompt, RESULT_SUMMARY_SYSTEM_PROMPT};
use crate::graph::state::{FinalStatus, Intent, Operation, ResultReturnResult, SqlValidateResult, TaskParseResult};
use crate::llm::{extract_json_object, CompletionClient, NODE_TEMPERATURE};
use crate::persistence::{chat_history, workflow_log, MessageRole, WorkflowStepStatus};
use crate::schema_kb::SchemaKnowledge;

const SUMMARY_TIMEOUT: Duration = Duration::from_secs(12);
const INLINE_ROW_LIMIT: usize = 10;

const DETAIL_GRAIN_COLUMNS: &[&str] = &[
    "course_code",
    "course_name",
    "course_id",
    "course_class_id",
    "score_value",
    "score_level",
    "attend_date",
    "term",
    "enroll_time",
];

/// Inputs gathered from the rest of the graph state needed to finalise a
/// request. Grouped into one struct since every field is read-only here.
pub struct ResultReturnInput<'a> {
    pub intent: Intent,
    pub user_query: &'a str,
    pub rewritten_query: &'a str,
    pub parse_result: Option<&'a TaskParseResult>,
    pub sql_validate_result: Option<&'a SqlValidateResult>,
    pub hidden_context_retry_count: u32,
    pub model: &'a str,
    pub admin_id: i64,
    pub session_id: &'a str,
}

pub async fn run(
    llm: &dyn CompletionClient,
    kb: &SchemaKnowledge,
    pool: &SqlitePool,
    export_dir: &std::path::Path,
    export_timestamp: i64,
    input: ResultReturnInput<'_>,
) -> Result<ResultReturnResult> {
    let (final_status, reason_code) = classify_final_status(&input);

    let rows = input
        .sql_validate_result
        .map(|v| v.result.clone())
        .unwrap_or_default();

    let operation = input.parse_result.map(|p| p.operation);
    let deduped_rows = apply_student_dedup_guard(&rows, operation);

    let field_display_hints = build_field_display_hints(kb, &deduped_rows);

    let sql_validate_json = post_dedupe_validate_json(input.sql_validate_result, &deduped_rows);

    let summary = match build_summary(
        llm,
        &input,
        final_status,
        &reason_code,
        sql_validate_json.as_ref(),
        &field_display_hints,
    )
    .await
    {
        Ok(summary) => summary,
        Err(_) => fallback_summary(&reason_code),
    };

    let assistant_reply = build_assistant_reply(
        &input,
        final_status,
        &summary,
        &deduped_rows,
        &field_display_hints,
        export_dir,
        export_timestamp,
    )?;

    let (reply_text, download_url) = assistant_reply;

    persist_turn(pool, &input, &reply_text).await?;

    Ok(ResultReturnResult {
        final_status,
        reason_code,
        summary,
        assistant_reply: reply_text,
        download_url,
        skipped: matches!(input.intent, Intent::Chat),
    })
}

fn classify_final_status(input: &ResultReturnInput<'_>) -> (FinalStatus, String) {
    if matches!(input.intent, Intent::Chat) {
        return (FinalStatus::Success, "intent_is_chat".to_string());
    }
    if input.parse_result.is_none() {
        return (FinalStatus::Failed, "task_parse_missing".to_string());
    }
    let Some(validate) = input.sql_validate_result else {
        return (FinalStatus::Failed, "sql_validate_missing".to_string());
    };
    if validate.is_valid && !validate.empty_result && !validate.zero_metric_result {
        return (FinalStatus::Success, String::new());
    }
    if validate.empty_result {
        return (FinalStatus::PartialSuccess, "empty_result_after_retry".to_string());
    }
    if validate.zero_metric_result {
        return (FinalStatus::PartialSuccess, "zero_metric_after_retry".to_string());
    }
    (FinalStatus::Failed, "sql_invalid_after_retry".to_string())
}

/// Groups rows by `(student_no, real_name)` when the operation is
/// `detail`/`ranking`, rows carry `student_no`, and no detail-grain column is
/// present. Distinct `reason` values are merged with the full-width `；`.
fn apply_student_dedup_guard(
    rows: &[Map<String, Json>],
    operation: Option<Operation>,
) -> Vec<Map<String, Json>> {
    let should_dedup = matches!(operation, Some(Operation::Detail) | Some(Operation::Ranking))
        && rows.iter().any(|r| r.contains_key("student_no"))
        && !rows.iter().any(|r| DETAIL_GRAIN_COLUMNS.iter().any(|c| r.contains_key(*c)));

    if !should_dedup {
        return rows.to_vec();
    }

    let mut order: Vec<(String, String)> = Vec::new();
    let mut grouped: std::collections::HashMap<(String, String), Map<String, Json>> = std::collections::HashMap::new();
    let mut reasons: std::collections::HashMap<(String, String), Vec<String>> = std::collections::HashMap::new();

    for row in rows {
        let student_no = row.get("student_no").map(json_to_string).unwrap_or_default();
        let real_name = row.get("real_name").map(json_to_string).unwrap_or_default();
        let key = (student_no, real_name);

        if !grouped.contains_key(&key) {
            order.push(key.clone());
            grouped.insert(key.clone(), row.clone());
        }

        if let Some(reason) = row.get("reason").map(json_to_string) {
            if !reason.is_empty() {
                let entry = reasons.entry(key).or_default();
                if !entry.contains(&reason) {
                    entry.push(reason);
                }
            }
        }
    }

    order
        .into_iter()
        .map(|key| {
            let mut row = grouped.remove(&key).unwrap();
            if let Some(merged) = reasons.get(&key) {
                row.insert("reason".to_string(), Json::String(merged.join("；")));
            }
            row
        })
        .collect()
}

/// Builds the validate-result JSON handed to the summary prompt, with its
/// `result` rows replaced by the post-dedupe view so the summary LLM never
/// sees a row count the assistant reply itself won't show.
fn post_dedupe_validate_json(
    validate: Option<&SqlValidateResult>,
    deduped_rows: &[Map<String, Json>],
) -> Option<Json> {
    let validate = validate?;
    let mut json = serde_json::to_value(validate).unwrap_or(Json::Null);
    if let Some(obj) = json.as_object_mut() {
        obj.insert("result".to_string(), Json::Array(deduped_rows.iter().cloned().map(Json::Object).collect()));
        obj.insert("rows".to_string(), Json::from(deduped_rows.len()));
    }
    Some(json)
}

fn json_to_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

/// Maps each distinct row key to its KB column description's leading
/// phrase: exact `table.field` match, then an unambiguous column-suffix
/// match, then a non-dotted alias.
fn build_field_display_hints(kb: &SchemaKnowledge, rows: &[Map<String, Json>]) -> Map<String, Json> {
    let mut keys: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
    }

    let mut hints = Map::new();
    for key in keys {
        if let Some(description) = describe_field(kb, &key) {
            hints.insert(key, Json::String(description));
        }
    }
    hints
}

fn describe_field(kb: &SchemaKnowledge, key: &str) -> Option<String> {
    if kb.is_whitelisted(key) {
        if let Some(desc) = lookup_description_exact(kb, key) {
            return Some(leading_phrase(&desc));
        }
    }

    let suffix_matches: Vec<&str> = kb
        .schema_hints()
        .iter()
        .flat_map(|t| t.columns.iter())
        .filter(|c| c.field.rsplit_once('.').map(|(_, f)| f == key).unwrap_or(false))
        .map(|c| c.field_description.as_str())
        .collect();
    if suffix_matches.len() == 1 {
        return Some(leading_phrase(suffix_matches[0]));
    }

    if let Some(field) = kb.resolve_alias(key) {
        if !field.is_empty() {
            if let Some(desc) = lookup_description_exact(kb, field) {
                return Some(leading_phrase(&desc));
            }
        }
    }

    None
}

fn lookup_description_exact(kb: &SchemaKnowledge, field: &str) -> Option<String> {
    kb.schema_hints()
        .iter()
        .flat_map(|t| t.columns.iter())
        .find(|c| c.field.eq_ignore_ascii_case(field))
        .map(|c| c.field_description.clone())
}

fn leading_phrase(description: &str) -> String {
    description
        .split(|c| c == '，' || c == ',' || c == '。' || c == '(')
        .next()
        .unwrap_or(description)
        .trim()
        .to_string()
}

async fn build_summary(
    llm: &dyn CompletionClient,
    input: &ResultReturnInput<'_>,
    final_status: FinalStatus,
    reason_code: &str,
    sql_validate_result: Option<&Json>,
    field_display_hints: &Map<String, Json>,
) -> Result<String> {
    let user_prompt = build_result_summary_user_prompt(
        input.user_query,
        input.rewritten_query,
        final_status.as_str(),
        if reason_code.is_empty() { None } else { Some(reason_code) },
        input.parse_result,
        sql_validate_result,
        input.hidden_context_retry_count,
        field_display_hints,
    );

    let raw = llm
        .complete(
            RESULT_SUMMARY_SYSTEM_PROMPT,
            &user_prompt,
            input.model,
            NODE_TEMPERATURE,
            SUMMARY_TIMEOUT,
        )
        .await?;

    let parsed = extract_json_object(&raw)?;
    parsed
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| crate::error::AppError::llm("summary response missing summary field"))
}

fn fallback_summary(reason_code: &str) -> String {
    match reason_code {
        "intent_is_chat" => "好的，请问还有什么可以帮您。".to_string(),
        "task_parse_missing" => "抱歉，暂时无法理解这个查询需求，请换一种方式描述。".to_string(),
        "sql_validate_missing" | "sql_invalid_after_retry" => {
            "抱歉，多次尝试后仍未能生成有效的查询，请尝试换一种提问方式。".to_string()
        }
        "empty_result_after_retry" => "按当前条件没有查到符合要求的数据，建议确认一下筛选条件是否准确。".to_string(),
        "zero_metric_after_retry" => "查询结果显示数量为 0，建议确认一下筛选条件是否准确。".to_string(),
        _ => "已完成查询。".to_string(),
    }
}

/// Returns `(assistant_reply, raw_download_url)`.
fn build_assistant_reply(
    input: &ResultReturnInput<'_>,
    final_status: FinalStatus,
    summary: &str,
    rows: &[Map<String, Json>],
    field_display_hints: &Map<String, Json>,
    export_dir: &std::path::Path,
    export_timestamp: i64,
) -> Result<(String, Option<String>)> {
    if matches!(input.intent, Intent::Chat) || !matches!(final_status, FinalStatus::Success) || rows.is_empty() {
        return Ok((summary.to_string(), None));
    }

    if rows.len() <= INLINE_ROW_LIMIT {
        let mut reply = summary.to_string();
        reply.push('\n');
        for (i, row) in rows.iter().enumerate() {
            reply.push_str(&format!("{}. {}\n", i + 1, format_row(row, field_display_hints)));
        }
        Ok((reply.trim_end().to_string(), None))
    } else {
        let filename = write_csv(export_dir, input.admin_id, input.session_id, export_timestamp, rows)?;
        let download_url = format!("/api/chat/downloads/{filename}");
        let reply = format!(
            "{summary}\n共 {} 条结果，仅展示前 {INLINE_ROW_LIMIT} 条，完整结果请下载：{download_url}",
            rows.len()
        );
        Ok((reply, Some(download_url)))
    }
}

fn format_row(row: &Map<String, Json>, field_display_hints: &Map<String, Json>) -> String {
    row.iter()
        .map(|(key, value)| {
            let label = field_display_hints
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or(key.as_str());
            format!("{label}: {}", json_to_string(value))
        })
        .collect::<Vec<_>>()
        .join("，")
}

/// Persists the user+assistant turn and the result_return step log as one
/// atomic commit. On any failure mid-transaction, the transaction rolls
/// back (implicitly, on drop) and a best-effort failure log row is written
/// in a fresh transaction so the request's outcome isn't silently lost.
async fn persist_turn(pool: &SqlitePool, input: &ResultReturnInput<'_>, assistant_reply: &str) -> Result<()> {
    match persist_turn_atomic(pool, input, assistant_reply).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = workflow_log::insert(
                pool,
                input.admin_id,
                input.session_id,
                "result_return",
                &serde_json::json!({"user_query": input.user_query}),
                Option::<&serde_json::Value>::None,
                WorkflowStepStatus::Failed,
                Some(&e.to_string()),
            )
            .await;
            Err(e)
        }
    }
}

async fn persist_turn_atomic(pool: &SqlitePool, input: &ResultReturnInput<'_>, assistant_reply: &str) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| crate::error::AppError::persistence(format!("failed to start transaction: {e}")))?;

    chat_history::insert(
        &mut *tx,
        input.admin_id,
        input.session_id,
        MessageRole::User,
        input.user_query,
        None,
        None,
    )
    .await?;
    chat_history::insert(
        &mut *tx,
        input.admin_id,
        input.session_id,
        MessageRole::Assistant,
        assistant_reply,
        None,
        Some(input.model),
    )
    .await?;

    workflow_log::insert(
        &mut *tx,
        input.admin_id,
        input.session_id,
        "result_return",
        &serde_json::json!({"user_query": input.user_query}),
        Some(&serde_json::json!({"assistant_reply": assistant_reply})),
        WorkflowStepStatus::Success,
        None,
    )
    .await?;

    tx.commit()
        .await
        .map_err(|e| crate::error::AppError::persistence(format!("failed to commit turn: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::state::{Intent as StateIntent, TimeRange};
    use crate::schema_kb::{KbColumn, KbTable, SchemaKb};
    use serde_json::json;

    fn kb() -> SchemaKnowledge {
        SchemaKnowledge::from_kb(SchemaKb {
            tables: vec![KbTable {
                name: "student".to_string(),
                description: "学生信息".to_string(),
                aliases: vec![],
                columns: vec![
                    KbColumn {
                        name: "real_name".to_string(),
                        description: "学生姓名，汉字全名".to_string(),
                        aliases: vec![],
                    },
                    KbColumn {
                        name: "student_no".to_string(),
                        description: "学号".to_string(),
                        aliases: vec![],
                    },
                ],
            }],
        })
    }

    #[test]
    fn test_final_status_chat() {
        let input = ResultReturnInput {
            intent: StateIntent::Chat,
            user_query: "你好",
            rewritten_query: "你好",
            parse_result: None,
            sql_validate_result: None,
            hidden_context_retry_count: 0,
            model: "gpt-4o-mini",
            admin_id: 1,
            session_id: "s1",
        };
        let (status, reason) = classify_final_status(&input);
        assert_eq!(status, FinalStatus::Success);
        assert_eq!(reason, "intent_is_chat");
    }

    #[test]
    fn test_final_status_empty_result() {
        let validate = SqlValidateResult {
            is_valid: true,
            error: None,
            rows: 0,
            result: vec![],
            executed_sql: String::new(),
            empty_result: true,
            zero_metric_result: false,
        };
        let task = TaskParseResult {
            intent: StateIntent::BusinessQuery,
            entities: vec![],
            dimensions: vec![],
            metrics: vec![],
            filters: vec![],
            time_range: TimeRange::default(),
            operation: Operation::Detail,
            confidence: 0.9,
        };
        let input = ResultReturnInput {
            intent: StateIntent::BusinessQuery,
            user_query: "q",
            rewritten_query: "q",
            parse_result: Some(&task),
            sql_validate_result: Some(&validate),
            hidden_context_retry_count: 2,
            model: "gpt-4o-mini",
            admin_id: 1,
            session_id: "s1",
        };
        let (status, reason) = classify_final_status(&input);
        assert_eq!(status, FinalStatus::PartialSuccess);
        assert_eq!(reason, "empty_result_after_retry");
    }

    #[test]
    fn test_student_dedup_merges_reasons() {
        let rows = vec![
            json!({"student_no": "S001", "real_name": "张三", "reason": "迟到"}).as_object().unwrap().clone(),
            json!({"student_no": "S001", "real_name": "张三", "reason": "早退"}).as_object().unwrap().clone(),
            json!({"student_no": "S002", "real_name": "李四", "reason": "迟到"}).as_object().unwrap().clone(),
        ];
        let deduped = apply_student_dedup_guard(&rows, Some(Operation::Detail));
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0]["reason"], json!("迟到；早退"));
    }

    #[test]
    fn test_summary_json_uses_post_dedupe_rows() {
        let raw_rows = vec![
            json!({"student_no": "S001", "real_name": "张三", "reason": "迟到"}).as_object().unwrap().clone(),
            json!({"student_no": "S001", "real_name": "张三", "reason": "早退"}).as_object().unwrap().clone(),
        ];
        let validate = SqlValidateResult {
            is_valid: true,
            error: None,
            rows: raw_rows.len(),
            result: raw_rows,
            executed_sql: String::new(),
            empty_result: false,
            zero_metric_result: false,
        };
        let deduped = apply_student_dedup_guard(&validate.result, Some(Operation::Detail));
        let json = post_dedupe_validate_json(Some(&validate), &deduped).unwrap();
        assert_eq!(json["rows"], json!(1));
        assert_eq!(json["result"].as_array().unwrap().len(), 1);
        assert_eq!(json["result"][0]["reason"], json!("迟到；早退"));
    }

    #[test]
    fn test_student_dedup_skipped_with_detail_grain_column() {
        let rows = vec![
            json!({"student_no": "S001", "real_name": "张三", "course_code": "C1", "score_value": 90}).as_object().unwrap().clone(),
            json!({"student_no": "S001", "real_name": "张三", "course_code": "C2", "score_value": 80}).as_object().unwrap().clone(),
        ];
        let deduped = apply_student_dedup_guard(&rows, Some(Operation::Detail));
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn test_describe_field_exact_and_suffix() {
        let kb = kb();
        assert_eq!(describe_field(&kb, "student.real_name"), Some("学生姓名".to_string()));
        assert_eq!(describe_field(&kb, "real_name"), Some("学生姓名".to_string()));
    }

    #[tokio::test]
    async fn test_run_sets_skipped_true_on_chat_intent_and_false_otherwise() {
        use crate::llm::mock::MockCompletionClient;
        use crate::persistence::migrations::run_migrations;
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let export_dir = tempfile::tempdir().unwrap();
        let kb = kb();
        let llm = MockCompletionClient::new();

        let chat_input = ResultReturnInput {
            intent: StateIntent::Chat,
            user_query: "你好",
            rewritten_query: "你好",
            parse_result: None,
            sql_validate_result: None,
            hidden_context_retry_count: 0,
            model: "gpt-4o-mini",
            admin_id: 1,
            session_id: "sess-chat",
        };
        let chat_result = run(&llm, &kb, &pool, export_dir.path(), 1700000000, chat_input)
            .await
            .unwrap();
        assert!(chat_result.skipped);

        let task = TaskParseResult {
            intent: StateIntent::BusinessQuery,
            entities: vec![],
            dimensions: vec![],
            metrics: vec![],
            filters: vec![],
            time_range: TimeRange::default(),
            operation: Operation::Detail,
            confidence: 0.9,
        };
        let validate = SqlValidateResult {
            is_valid: true,
            error: None,
            rows: 0,
            result: vec![],
            executed_sql: String::new(),
            empty_result: true,
            zero_metric_result: false,
        };
        let business_input = ResultReturnInput {
            intent: StateIntent::BusinessQuery,
            user_query: "统计学生",
            rewritten_query: "统计学生",
            parse_result: Some(&task),
            sql_validate_result: Some(&validate),
            hidden_context_retry_count: 2,
            model: "gpt-4o-mini",
            admin_id: 1,
            session_id: "sess-business",
        };
        let business_result = run(&llm, &kb, &pool, export_dir.path(), 1700000000, business_input)
            .await
            .unwrap();
        assert!(!business_result.skipped);
    }

    #[tokio::test]
    async fn test_persist_turn_writes_pair_and_step_log_atomically() {
        use crate::persistence::migrations::run_migrations;
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        let input = ResultReturnInput {
            intent: StateIntent::Chat,
            user_query: "你好",
            rewritten_query: "你好",
            parse_result: None,
            sql_validate_result: None,
            hidden_context_retry_count: 0,
            model: "gpt-4o-mini",
            admin_id: 1,
            session_id: "sess-atomic",
        };

        persist_turn(&pool, &input, "您好，请问有什么可以帮您。").await.unwrap();

        let (messages, _) = crate::persistence::chat_history::list_messages(&pool, 1, "sess-atomic", 0, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);

        let steps = crate::persistence::workflow_log::list_for_session(&pool, "sess-atomic")
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_name, "result_return");
        assert_eq!(steps[0].status, "success");
    }
}
