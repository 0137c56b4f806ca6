//! Hidden-context probe: classify a failed/uninformative SQL attempt, probe
//! real column values from the database, and surface candidates the next
//! SQL-generation attempt can use.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::db::DatabaseClient;
use crate::graph::state::{
    ErrorType, FieldCandidate, HiddenContextResult, MatchStrategy, ProbeSample, RetryReason, SqlResult,
    SqlValidateResult, TaskParseResult, ValueCandidate,
};
use crate::schema_kb::SchemaKnowledge;
use crate::sql::safety::is_readonly_sql;

const MAX_FIELD_CANDIDATES: usize = 12;
const MAX_PER_FIELD_PROBE_CANDIDATES: usize = 6;
const MAX_TOTAL_PROBE_FIELDS: usize = 24;
const PROBE_VALUE_LIMIT: usize = 20;

static MISSING_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)unknown column\s*['"`]([a-zA-Z_][a-zA-Z0-9_.]*)['"`]"#).unwrap()
});
static GENERIC_FIELD_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_]*)\.([a-zA-Z_][a-zA-Z0-9_]*)\b").unwrap());

pub async fn run(
    db: &dyn DatabaseClient,
    kb: &SchemaKnowledge,
    rewritten_query: &str,
    parse_result: Option<&TaskParseResult>,
    sql_result: Option<&SqlResult>,
    sql_validate_result: Option<&SqlValidateResult>,
    retry_count_before: u32,
) -> HiddenContextResult {
    let validate = sql_validate_result.cloned().unwrap_or_default();

    let retry_reason = if !validate.is_valid {
        RetryReason::SqlError
    } else if validate.empty_result {
        RetryReason::EmptyResult
    } else {
        RetryReason::ZeroMetricResult
    };

    let error_text = validate.error.clone().unwrap_or_default();
    let error_type = classify_error_type(&error_text);

    let candidate_fields = collect_candidate_fields(kb, sql_result, parse_result);

    let missing_tokens = extract_missing_tokens(&error_text);

    let mut field_candidates = Vec::new();
    for missing in &missing_tokens {
        let suffix = missing.rsplit_once('.').map(|(_, s)| s).unwrap_or(missing);
        let missing_table = missing.rsplit_once('.').map(|(t, _)| t).unwrap_or("");
        let mut candidates = kb.candidates_for_suffix(suffix, MAX_FIELD_CANDIDATES);
        if candidates.is_empty() && !missing_table.is_empty() {
            candidates = kb
                .whitelist_sorted()
                .into_iter()
                .filter(|f| SchemaKnowledge::table_of(f).eq_ignore_ascii_case(missing_table))
                .take(MAX_FIELD_CANDIDATES)
                .collect();
        }
        if !candidates.is_empty() {
            field_candidates.push(FieldCandidate {
                missing: missing.clone(),
                candidates,
            });
        }
    }

    let mut probe_fields: Vec<String> = Vec::new();
    let mut seen_probe: HashSet<String> = HashSet::new();
    for field in &candidate_fields {
        if probe_fields.len() >= MAX_TOTAL_PROBE_FIELDS {
            break;
        }
        if seen_probe.insert(field.to_lowercase()) {
            probe_fields.push(field.clone());
        }
    }
    for fc in &field_candidates {
        for candidate in fc.candidates.iter().take(MAX_PER_FIELD_PROBE_CANDIDATES) {
            if probe_fields.len() >= MAX_TOTAL_PROBE_FIELDS {
                break;
            }
            if seen_probe.insert(candidate.to_lowercase()) {
                probe_fields.push(candidate.clone());
            }
        }
    }

    let mut probe_samples = Vec::new();
    for field in &probe_fields {
        let table = SchemaKnowledge::table_of(field);
        let limit_clause = if table.eq_ignore_ascii_case("class") {
            String::new()
        } else {
            format!(" LIMIT {PROBE_VALUE_LIMIT}")
        };
        let probe_sql = format!(
            "SELECT DISTINCT {field} AS value FROM {table} WHERE {field} IS NOT NULL AND {table}.is_deleted = 0{limit_clause}"
        );

        if !is_readonly_sql(&probe_sql) {
            probe_samples.push(ProbeSample {
                field: field.clone(),
                probe_sql,
                values: Vec::new(),
                error: Some("sql_validate_readonly_violation".to_string()),
            });
            continue;
        }

        match db.execute_query(&probe_sql).await {
            Ok(result) => {
                let values: Vec<String> = result
                    .to_json_rows()
                    .into_iter()
                    .filter_map(|row| row.get("value").cloned())
                    .filter(|v| !v.is_null())
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .take(PROBE_VALUE_LIMIT)
                    .collect();
                probe_samples.push(ProbeSample {
                    field: field.clone(),
                    probe_sql,
                    values,
                    error: None,
                });
            }
            Err(e) => {
                probe_samples.push(ProbeSample {
                    field: field.clone(),
                    probe_sql,
                    values: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let value_candidates = compute_value_candidates(parse_result, &probe_samples);

    let mut hints = Vec::new();
    hints.push(format!("error_type={}", error_type_str(error_type)));
    if !missing_tokens.is_empty() {
        hints.push(format!("missing_tokens={}", missing_tokens.join(",")));
    }
    if !field_candidates.is_empty() {
        hints.push("enforce_field_replacements_from_field_candidates".to_string());
    }
    if probe_samples.iter().any(|s| !s.values.is_empty()) {
        hints.push("use_probe_samples_to_rewrite_filters_or_entities".to_string());
    }
    if validate.empty_result && !value_candidates.is_empty() {
        hints.push("prioritize_value_candidates_for_empty_result".to_string());
    }
    hints.push("retry_sql_generation_with_hidden_context".to_string());

    HiddenContextResult {
        retry_reason,
        error_type,
        error: error_text,
        failed_sql: validate.executed_sql,
        rewritten_query: rewritten_query.to_string(),
        field_candidates,
        probe_samples,
        value_candidates,
        hints,
        retry_count: retry_count_before + 1,
    }
}

fn classify_error_type(error_text: &str) -> ErrorType {
    let lower = error_text.to_lowercase();
    if lower.contains("unknown column") || lower.contains("column") && lower.contains("does not exist") {
        ErrorType::UnknownColumn
    } else if lower.contains("unknown table") || lower.contains("relation") && lower.contains("does not exist") {
        ErrorType::UnknownTable
    } else if lower.contains("syntax error") {
        ErrorType::SyntaxError
    } else if lower.contains("not found") || lower.contains("no such") {
        ErrorType::ObjectNotFound
    } else {
        ErrorType::ExecutionError
    }
}

fn error_type_str(error_type: ErrorType) -> &'static str {
    match error_type {
        ErrorType::UnknownColumn => "unknown_column",
        ErrorType::UnknownTable => "unknown_table",
        ErrorType::SyntaxError => "syntax_error",
        ErrorType::ObjectNotFound => "object_not_found",
        ErrorType::ExecutionError => "execution_error",
    }
}

fn collect_candidate_fields(
    kb: &SchemaKnowledge,
    sql_result: Option<&SqlResult>,
    parse_result: Option<&TaskParseResult>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut fields = Vec::new();

    let mut push = |field: &str, fields: &mut Vec<String>, seen: &mut HashSet<String>| {
        if kb.is_whitelisted(field) && seen.insert(field.to_lowercase()) {
            fields.push(field.to_string());
        }
    };

    if let Some(sql_result) = sql_result {
        for f in &sql_result.sql_fields {
            push(f, &mut fields, &mut seen);
        }
    }
    if let Some(parse_result) = parse_result {
        for d in &parse_result.dimensions {
            push(d, &mut fields, &mut seen);
        }
        for f in &parse_result.filters {
            push(&f.field, &mut fields, &mut seen);
        }
        for m in &parse_result.metrics {
            for caps in GENERIC_FIELD_TOKEN_RE.captures_iter(m) {
                let field = format!("{}.{}", &caps[1], &caps[2]);
                push(&field, &mut fields, &mut seen);
            }
        }
    }

    fields
}

fn extract_missing_tokens(error_text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for caps in MISSING_TOKEN_RE.captures_iter(error_text) {
        let token = caps[1].to_string();
        if seen.insert(token.to_lowercase()) {
            tokens.push(token);
        }
    }
    if tokens.is_empty() {
        for caps in GENERIC_FIELD_TOKEN_RE.captures_iter(error_text) {
            let token = format!("{}.{}", &caps[1], &caps[2]);
            if seen.insert(token.to_lowercase()) {
                tokens.push(token);
            }
        }
    }
    tokens
}

fn compute_value_candidates(
    parse_result: Option<&TaskParseResult>,
    probe_samples: &[ProbeSample],
) -> Vec<ValueCandidate> {
    let Some(parse_result) = parse_result else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for filter in &parse_result.filters {
        let Some(sample) = probe_samples
            .iter()
            .find(|s| s.field.eq_ignore_ascii_case(&filter.field))
        else {
            continue;
        };
        if sample.values.is_empty() {
            continue;
        }

        let original_value = filter
            .value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| filter.value.to_string());
        let normalized_original = normalize(&original_value);

        if let Some(exact) = sample
            .values
            .iter()
            .find(|v| v.eq_ignore_ascii_case(&original_value))
        {
            out.push(ValueCandidate {
                field: filter.field.clone(),
                original_value,
                candidates: vec![exact.clone()],
                match_strategy: MatchStrategy::Exact,
            });
            continue;
        }

        if let Some(normalized) = sample.values.iter().find(|v| normalize(v) == normalized_original) {
            out.push(ValueCandidate {
                field: filter.field.clone(),
                original_value,
                candidates: vec![normalized.clone()],
                match_strategy: MatchStrategy::Normalized,
            });
            continue;
        }

        let fuzzy: Vec<String> = sample
            .values
            .iter()
            .filter(|v| {
                let nv = normalize(v);
                nv.contains(&normalized_original) || normalized_original.contains(&nv)
            })
            .cloned()
            .collect();
        if !fuzzy.is_empty() {
            out.push(ValueCandidate {
                field: filter.field.clone(),
                original_value,
                candidates: fuzzy,
                match_strategy: MatchStrategy::Fuzzy,
            });
            continue;
        }

        out.push(ValueCandidate {
            field: filter.field.clone(),
            original_value,
            candidates: sample.values.iter().take(5).cloned().collect(),
            match_strategy: MatchStrategy::FallbackProbeTopn,
        });
    }

    out
}

fn normalize(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase()
}
