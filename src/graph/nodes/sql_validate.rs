//! SQL validation: execute a generated statement against the business
//! database after a final read-only gate check, and detect "technically
//! valid but uninformative" results (empty rows, a lone zero metric).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as Json;

use crate::db::DatabaseClient;
use crate::graph::state::SqlValidateResult;
use crate::sql::safety::is_readonly_sql;

/// Column-alias keywords that mark a value as a count/aggregate metric.
const METRIC_KEYWORDS: &[&str] = &[
    "count", "sum", "avg", "total", "num", "cnt", "ren_shu", "shu_liang", "zong_shu", "he_ji", "ping_jun",
    "jun_zhi", "ratio", "rate", "percent",
];

static ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bas\s+[`\x22]?([a-zA-Z_][a-zA-Z0-9_]*)[`\x22]?").unwrap());

static AGGREGATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\b(count|sum|avg|max|min)\s*\(").unwrap());

/// Runs the sql_validate node: executes `sql` against `db` and classifies
/// the outcome. Never propagates a database error; it is captured as
/// `is_valid = false` with `error` set to the driver's message.
pub async fn run(db: &dyn DatabaseClient, sql: &str) -> SqlValidateResult {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return SqlValidateResult {
            is_valid: false,
            error: Some("sql_validate_empty_statement".to_string()),
            rows: 0,
            result: Vec::new(),
            executed_sql: String::new(),
            empty_result: false,
            zero_metric_result: false,
        };
    }

    if !is_readonly_sql(trimmed) {
        return SqlValidateResult {
            is_valid: false,
            error: Some("sql_validate_readonly_violation".to_string()),
            rows: 0,
            result: Vec::new(),
            executed_sql: trimmed.to_string(),
            empty_result: false,
            zero_metric_result: false,
        };
    }

    let query_result = match db.execute_query(trimmed).await {
        Ok(result) => result,
        Err(e) => {
            return SqlValidateResult {
                is_valid: false,
                error: Some(e.to_string()),
                rows: 0,
                result: Vec::new(),
                executed_sql: trimmed.to_string(),
                empty_result: false,
                zero_metric_result: false,
            }
        }
    };

    let rows = query_result.to_json_rows();
    let row_count = rows.len();

    let empty_result =
        row_count == 0 || (row_count == 1 && AGGREGATE_RE.is_match(trimmed) && all_null(&rows[0]));
    let zero_metric_result = !empty_result && row_count >= 1 && has_zero_metric(trimmed, &rows[0]);

    SqlValidateResult {
        is_valid: true,
        error: None,
        rows: row_count,
        result: rows,
        executed_sql: trimmed.to_string(),
        empty_result,
        zero_metric_result,
    }
}

fn all_null(row: &serde_json::Map<String, Json>) -> bool {
    row.values().all(|v| v.is_null())
}

fn has_zero_metric(sql: &str, row: &serde_json::Map<String, Json>) -> bool {
    let metric_aliases: Vec<String> = ALIAS_RE
        .captures_iter(sql)
        .map(|c| c[1].to_lowercase())
        .filter(|alias| METRIC_KEYWORDS.iter().any(|kw| alias.contains(kw)))
        .collect();

    if metric_aliases.is_empty() {
        return false;
    }

    metric_aliases.iter().any(|alias| {
        row.iter()
            .find(|(k, _)| k.to_lowercase() == *alias)
            .map(|(_, v)| is_zero_number(v))
            .unwrap_or(false)
    })
}

fn is_zero_number(value: &Json) -> bool {
    match value {
        Json::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        _ => false,
    }
}
