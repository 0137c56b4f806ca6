//! The graph state record and its per-node sub-records.
//!
//! Mirrors a dynamically-typed state bag with a tagged-state record: each
//! node reads the slots it depends on and writes exactly one slot, matching
//! the "synchronous function mutating its slot" runtime model.

use serde::{Deserialize, Serialize};

/// The full state carried through one request's graph execution.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub message: String,
    pub history_user_messages: Vec<String>,
    pub threshold: f64,
    pub model_name: String,

    pub intent_result: Option<IntentResult>,
    pub parse_result: Option<TaskParseResult>,
    pub sql_result: Option<SqlResult>,
    pub sql_validate_result: Option<SqlValidateResult>,
    pub hidden_context_result: Option<HiddenContextResult>,
    pub result_return_result: Option<ResultReturnResult>,

    pub hidden_context_retry_count: u32,
}

impl GraphState {
    pub fn new(message: String, history_user_messages: Vec<String>, threshold: f64, model_name: String) -> Self {
        Self {
            message,
            history_user_messages,
            threshold,
            model_name,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Chat,
    BusinessQuery,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::BusinessQuery => "business_query",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    pub is_followup: bool,
    pub confidence: f64,
    pub merged_query: String,
    pub rewritten_query: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Detail,
    Aggregate,
    Ranking,
    Trend,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::Aggregate => "aggregate",
            Self::Ranking => "ranking",
            Self::Trend => "trend",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParseResult {
    pub intent: Intent,
    pub entities: Vec<Entity>,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub filters: Vec<Filter>,
    pub time_range: TimeRange,
    pub operation: Operation,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMapping {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    pub field: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReplacement {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlResult {
    pub sql: String,
    #[serde(default)]
    pub entity_mappings: Vec<EntityMapping>,
    #[serde(default)]
    pub sql_fields: Vec<String>,
    #[serde(default)]
    pub applied_field_replacements: Vec<FieldReplacement>,
    #[serde(default)]
    pub generation_failed: bool,
    #[serde(default)]
    pub generation_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlValidateResult {
    pub is_valid: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub rows: usize,
    pub result: Vec<serde_json::Map<String, serde_json::Value>>,
    pub executed_sql: String,
    #[serde(default)]
    pub empty_result: bool,
    #[serde(default)]
    pub zero_metric_result: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    SqlError,
    EmptyResult,
    ZeroMetricResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    UnknownColumn,
    UnknownTable,
    SyntaxError,
    ObjectNotFound,
    ExecutionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldCandidate {
    pub missing: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSample {
    pub field: String,
    pub probe_sql: String,
    pub values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Normalized,
    Fuzzy,
    FallbackProbeTopn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueCandidate {
    pub field: String,
    pub original_value: String,
    pub candidates: Vec<String>,
    pub match_strategy: MatchStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiddenContextResult {
    pub retry_reason: RetryReason,
    pub error_type: ErrorType,
    pub error: String,
    pub failed_sql: String,
    pub rewritten_query: String,
    pub field_candidates: Vec<FieldCandidate>,
    pub probe_samples: Vec<ProbeSample>,
    pub value_candidates: Vec<ValueCandidate>,
    pub hints: Vec<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReturnResult {
    pub final_status: FinalStatus,
    pub reason_code: String,
    pub summary: String,
    pub assistant_reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub skipped: bool,
}
