//! SQL generation: task -> read-only CTE-form SQL, with deterministic
//! post-processing to repair non-whitelisted field references using hidden
//! context field candidates.

use std::time::Duration;

use crate::error::{AppError, Result};
use crate::graph::prompts::{build_sql_generation_user_prompt, SQL_GENERATION_SYSTEM_PROMPT};
use crate::graph::state::{
    Entity, EntityMapping, FieldCandidate, FieldReplacement, HiddenContextResult, SqlResult, SqlValidateResult,
    TaskParseResult,
};
use crate::llm::{extract_json_object, CompletionClient, NODE_TEMPERATURE};
use crate::schema_kb::SchemaKnowledge;
use crate::sql::safety::{extract_cte_names, extract_sql_fields, normalize_whitespace};

const TIMEOUT: Duration = Duration::from_secs(25);

/// Outcome of the sql_generation node: either a usable SQL result, or a
/// failed one paired with the synthetic validate result the router needs to
/// decide whether a hidden-context retry is still possible.
pub struct GenerationOutcome {
    pub sql_result: SqlResult,
    pub sql_validate_result: Option<SqlValidateResult>,
}

fn failure(error: impl Into<String>) -> GenerationOutcome {
    let message = error.into();
    GenerationOutcome {
        sql_result: SqlResult {
            sql: String::new(),
            generation_failed: true,
            generation_error: Some(message.clone()),
            ..Default::default()
        },
        sql_validate_result: Some(SqlValidateResult {
            is_valid: false,
            error: Some(message),
            rows: 0,
            result: Vec::new(),
            executed_sql: String::new(),
            empty_result: false,
            zero_metric_result: false,
        }),
    }
}

pub async fn run(
    llm: &dyn CompletionClient,
    kb: &SchemaKnowledge,
    rewritten_query: &str,
    task: &TaskParseResult,
    hidden_context: Option<&HiddenContextResult>,
    model: &str,
) -> Result<GenerationOutcome> {
    let whitelist = kb.whitelist_sorted();
    let user_prompt = build_sql_generation_user_prompt(
        rewritten_query,
        task,
        &whitelist,
        kb.alias_pairs(),
        kb.schema_hints(),
        hidden_context,
    );

    let raw = match llm
        .complete(SQL_GENERATION_SYSTEM_PROMPT, &user_prompt, model, NODE_TEMPERATURE, TIMEOUT)
        .await
    {
        Ok(raw) => raw,
        Err(e) => return Ok(failure(format!("completion request failed: {e}"))),
    };

    let parsed = match extract_json_object(&raw) {
        Ok(v) => v,
        Err(e) => return Ok(failure(format!("non-JSON response: {e}"))),
    };

    let sql = match parsed.get("sql").and_then(|v| v.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return Ok(failure("missing or empty sql")),
    };

    if !sql.to_lowercase().starts_with("with") {
        return Ok(failure("sql must be in CTE form (start with WITH)"));
    }

    let entity_mappings: Vec<EntityMapping> = parsed
        .get("entity_mappings")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(EntityMapping {
                        entity_type: item.get("type")?.as_str()?.to_string(),
                        value: item.get("value")?.as_str()?.to_string(),
                        field: item.get("field")?.as_str()?.to_string(),
                        reason: item
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let sql = normalize_whitespace(&sql);
    let cte_names = extract_cte_names(&sql);
    let mut sql_fields = extract_sql_fields(&sql);
    if sql_fields.is_empty() {
        return Ok(failure("sql references no table.field tokens"));
    }

    let non_whitelisted: Vec<String> = sql_fields
        .iter()
        .filter(|f| {
            let table = SchemaKnowledge::table_of(f).to_lowercase();
            !cte_names.contains(&table) && !kb.is_whitelisted(f)
        })
        .cloned()
        .collect();

    let mut applied_field_replacements = Vec::new();
    let mut sql = sql;

    if !non_whitelisted.is_empty() {
        for bad_field in &non_whitelisted {
            if let Some(replacement) = pick_replacement(bad_field, hidden_context) {
                sql = replace_field_token(&sql, bad_field, &replacement);
                applied_field_replacements.push(FieldReplacement {
                    from: bad_field.clone(),
                    to: replacement,
                });
            }
        }
    }

    let cte_names = extract_cte_names(&sql);
    sql_fields = extract_sql_fields(&sql);

    let still_bad: Vec<&String> = sql_fields
        .iter()
        .filter(|f| {
            let table = SchemaKnowledge::table_of(f).to_lowercase();
            !cte_names.contains(&table) && !kb.is_whitelisted(f)
        })
        .collect();

    if !still_bad.is_empty() {
        return Ok(failure(format!(
            "sql references fields outside the whitelist: {}",
            still_bad.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }

    if !entities_covered(&task.entities, &entity_mappings, &sql_fields) {
        return Ok(failure("entity_mappings do not cover every parsed entity"));
    }

    Ok(GenerationOutcome {
        sql_result: SqlResult {
            sql,
            entity_mappings,
            sql_fields,
            applied_field_replacements,
            generation_failed: false,
            generation_error: None,
        },
        sql_validate_result: None,
    })
}

/// Picks a replacement whitelisted field for a non-whitelisted token, using
/// the field candidates surfaced by a prior hidden-context cycle:
/// prefer a same-table candidate, then an `_id`-suffix candidate matching the
/// bad field's own suffix style, then the first candidate.
fn pick_replacement(bad_field: &str, hidden_context: Option<&HiddenContextResult>) -> Option<String> {
    let hidden_context = hidden_context?;
    let candidates: &[FieldCandidate] = &hidden_context.field_candidates;
    let entry = candidates
        .iter()
        .find(|c| c.missing.eq_ignore_ascii_case(bad_field))?;
    if entry.candidates.is_empty() {
        return None;
    }

    let bad_table = SchemaKnowledge::table_of(bad_field).to_lowercase();
    let bad_suffix_is_id = bad_field.to_lowercase().ends_with("_id");

    if bad_suffix_is_id {
        let table_id_field = format!("{bad_table}.id");
        // Same-table `_id` candidate, excluding the table's own surrogate key.
        if let Some(id_match) = entry.candidates.iter().find(|c| {
            let lower = c.to_lowercase();
            lower.ends_with("_id") && lower != table_id_field && SchemaKnowledge::table_of(c).to_lowercase() == bad_table
        }) {
            return Some(id_match.clone());
        }
        // Any `_id` candidate, excluding the table's own surrogate key.
        if let Some(id_match) = entry
            .candidates
            .iter()
            .find(|c| c.to_lowercase().ends_with("_id") && c.to_lowercase() != table_id_field)
        {
            return Some(id_match.clone());
        }
    }

    if let Some(same_table) = entry
        .candidates
        .iter()
        .find(|c| SchemaKnowledge::table_of(c).to_lowercase() == bad_table)
    {
        return Some(same_table.clone());
    }

    entry.candidates.first().cloned()
}

fn replace_field_token(sql: &str, from: &str, to: &str) -> String {
    let pattern = regex::Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from))).unwrap();
    pattern.replace_all(sql, to.replace('$', "$$")).into_owned()
}

fn entities_covered(entities: &[Entity], mappings: &[EntityMapping], sql_fields: &[String]) -> bool {
    if entities.is_empty() {
        return true;
    }
    entities.iter().all(|entity| {
        mappings.iter().any(|m| {
            m.entity_type.eq_ignore_ascii_case(&entity.entity_type)
                && m.value == entity.value
                && sql_fields.iter().any(|f| f.eq_ignore_ascii_case(&m.field))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::state::{Intent, Operation, TimeRange};
    use crate::llm::mock::MockCompletionClient;
    use crate::schema_kb::{KbColumn, KbTable, SchemaKb};

    fn kb() -> SchemaKnowledge {
        SchemaKnowledge::from_kb(SchemaKb {
            tables: vec![KbTable {
                name: "student".to_string(),
                description: "学生信息".to_string(),
                aliases: vec![],
                columns: vec![
                    KbColumn {
                        name: "real_name".to_string(),
                        description: "姓名".to_string(),
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

    fn empty_task() -> TaskParseResult {
        TaskParseResult {
            intent: Intent::BusinessQuery,
            entities: vec![],
            dimensions: vec![],
            metrics: vec![],
            filters: vec![],
            time_range: TimeRange::default(),
            operation: Operation::Detail,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn test_valid_cte_sql_passes() {
        let kb = kb();
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"sql":"WITH t AS (SELECT student.real_name, student.student_no FROM student) SELECT * FROM t",
               "entity_mappings":[],"sql_fields":["student.real_name","student.student_no"]}"#,
        );
        let outcome = run(&llm, &kb, "列出学生", &empty_task(), None, "gpt-4o-mini")
            .await
            .unwrap();
        assert!(!outcome.sql_result.generation_failed);
        assert!(outcome.sql_result.sql.starts_with("WITH"));
    }

    #[tokio::test]
    async fn test_non_with_sql_fails() {
        let kb = kb();
        let llm = MockCompletionClient::new()
            .with_queued_response(r#"{"sql":"SELECT * FROM student","entity_mappings":[],"sql_fields":[]}"#);
        let outcome = run(&llm, &kb, "列出学生", &empty_task(), None, "gpt-4o-mini")
            .await
            .unwrap();
        assert!(outcome.sql_result.generation_failed);
        assert!(outcome.sql_validate_result.is_some());
    }

    #[tokio::test]
    async fn test_non_whitelisted_field_without_hidden_context_fails() {
        let kb = kb();
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"sql":"WITH t AS (SELECT student.nickname FROM student) SELECT * FROM t",
               "entity_mappings":[],"sql_fields":["student.nickname"]}"#,
        );
        let outcome = run(&llm, &kb, "列出学生", &empty_task(), None, "gpt-4o-mini")
            .await
            .unwrap();
        assert!(outcome.sql_result.generation_failed);
    }

    #[tokio::test]
    async fn test_field_replacement_via_hidden_context() {
        let kb = kb();
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"sql":"WITH t AS (SELECT student.nickname FROM student) SELECT * FROM t",
               "entity_mappings":[],"sql_fields":["student.nickname"]}"#,
        );
        let hidden_context = HiddenContextResult {
            retry_reason: crate::graph::state::RetryReason::SqlError,
            error_type: crate::graph::state::ErrorType::UnknownColumn,
            error: "unknown column".to_string(),
            failed_sql: String::new(),
            rewritten_query: "列出学生".to_string(),
            field_candidates: vec![FieldCandidate {
                missing: "student.nickname".to_string(),
                candidates: vec!["student.real_name".to_string()],
            }],
            probe_samples: vec![],
            value_candidates: vec![],
            hints: vec![],
            retry_count: 1,
        };
        let outcome = run(&llm, &kb, "列出学生", &empty_task(), Some(&hidden_context), "gpt-4o-mini")
            .await
            .unwrap();
        assert!(!outcome.sql_result.generation_failed);
        assert_eq!(outcome.sql_result.applied_field_replacements.len(), 1);
        assert!(outcome.sql_result.sql.contains("student.real_name"));
    }

    #[tokio::test]
    async fn test_id_suffix_replacement_prefers_id_candidate_over_same_table() {
        let kb = SchemaKnowledge::from_kb(SchemaKb {
            tables: vec![
                KbTable {
                    name: "student".to_string(),
                    description: "学生信息".to_string(),
                    aliases: vec![],
                    columns: vec![KbColumn {
                        name: "real_name".to_string(),
                        description: "姓名".to_string(),
                        aliases: vec![],
                    }],
                },
                KbTable {
                    name: "class".to_string(),
                    description: "班级信息".to_string(),
                    aliases: vec![],
                    columns: vec![KbColumn {
                        name: "class_id".to_string(),
                        description: "班级编号".to_string(),
                        aliases: vec![],
                    }],
                },
            ],
        });
        let llm = MockCompletionClient::new().with_queued_response(
            r#"{"sql":"WITH t AS (SELECT student.class_fk FROM student) SELECT * FROM t",
               "entity_mappings":[],"sql_fields":["student.class_fk"]}"#,
        );
        // `class_fk` is missing but looks like a foreign key; a same-table
        // non-id candidate exists alongside a cross-table id candidate. The
        // id-suffixed candidate should win per the replacement priority rules.
        let hidden_context = HiddenContextResult {
            retry_reason: crate::graph::state::RetryReason::SqlError,
            error_type: crate::graph::state::ErrorType::UnknownColumn,
            error: "unknown column".to_string(),
            failed_sql: String::new(),
            rewritten_query: "列出学生".to_string(),
            field_candidates: vec![FieldCandidate {
                missing: "student.class_fk".to_string(),
                candidates: vec!["student.real_name".to_string(), "class.class_id".to_string()],
            }],
            probe_samples: vec![],
            value_candidates: vec![],
            hints: vec![],
            retry_count: 1,
        };
        let outcome = run(&llm, &kb, "列出学生", &empty_task(), Some(&hidden_context), "gpt-4o-mini")
            .await
            .unwrap();
        assert_eq!(
            outcome.sql_result.applied_field_replacements,
            vec![FieldReplacement {
                from: "student.class_fk".to_string(),
                to: "class.class_id".to_string(),
            }]
        );
    }
}
