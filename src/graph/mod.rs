//! The conversational query graph: a deterministic 6-node state machine
//! with conditional routing and a bounded hidden-context retry loop.

pub mod nodes;
pub mod prompts;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedSender;

use crate::db::DatabaseClient;
use crate::error::Result;
use crate::llm::CompletionClient;
use crate::persistence::WorkflowStepStatus;
use crate::schema_kb::SchemaKnowledge;
use state::{GraphState, Intent};

/// A step lifecycle event, emitted to an optional listener so the SSE
/// streaming handler can relay graph progress to the client.
#[derive(Debug, Clone)]
pub enum StepEvent {
    Start { step: &'static str },
    End { step: &'static str },
    Error { step: &'static str, message: String },
}

/// Everything one request's graph run needs that outlives the request
/// (shared ports and connections), grouped so the runner's signature stays
/// manageable as nodes are added.
pub struct GraphContext<'a> {
    pub llm: &'a dyn CompletionClient,
    pub db: &'a dyn DatabaseClient,
    pub kb: &'a SchemaKnowledge,
    pub state_pool: &'a SqlitePool,
    pub export_dir: &'a Path,
    pub node_io_log_dir: &'a Path,
    pub admin_id: i64,
    pub session_id: &'a str,
    pub events: Option<UnboundedSender<StepEvent>>,
    pub hidden_context_max_retry: u32,
}

fn emit(ctx: &GraphContext<'_>, event: StepEvent) {
    if let Some(tx) = &ctx.events {
        let _ = tx.send(event);
    }
}

/// Runs the full graph for one request and returns the finalised state.
///
/// Node ordering and state mutation are sequential: this function is the
/// only place conditional routing between nodes is decided.
pub async fn run(ctx: &GraphContext<'_>, mut state: GraphState, export_timestamp: i64) -> Result<GraphState> {
    emit(ctx, StepEvent::Start { step: "intent_recognition" });
    let intent_result = nodes::intent_recognition::run(
        ctx.llm,
        &state.message,
        &state.history_user_messages,
        state.threshold,
        &state.model_name,
    )
    .await;

    let intent_result = log_and_propagate(ctx, "intent_recognition", &state.message, intent_result).await?;
    emit(ctx, StepEvent::End { step: "intent_recognition" });
    let intent = intent_result.intent;
    let rewritten_query = intent_result.rewritten_query.clone();
    state.intent_result = Some(intent_result);

    if matches!(intent, Intent::Chat) {
        return finalize(ctx, state, export_timestamp).await;
    }

    emit(ctx, StepEvent::Start { step: "task_parse" });
    let parse_result = nodes::task_parse::run(ctx.llm, ctx.kb, &rewritten_query, &state.model_name).await;
    let parse_result = log_and_propagate(ctx, "task_parse", &rewritten_query, parse_result).await?;
    emit(ctx, StepEvent::End { step: "task_parse" });
    state.parse_result = Some(parse_result);

    loop {
        emit(ctx, StepEvent::Start { step: "sql_generation" });
        let hidden_context_ref = state.hidden_context_result.as_ref();
        let outcome = nodes::sql_generation::run(
            ctx.llm,
            ctx.kb,
            &rewritten_query,
            state.parse_result.as_ref().unwrap(),
            hidden_context_ref,
            &state.model_name,
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => {
                log_step(ctx, "sql_generation", &rewritten_query, Ok(&outcome.sql_result)).await;
                outcome
            }
            Err(e) => {
                log_step(ctx, "sql_generation", &rewritten_query, Err::<&state::SqlResult, _>(&e)).await;
                emit(ctx, StepEvent::Error { step: "sql_generation", message: e.to_string() });
                return Err(e);
            }
        };
        emit(ctx, StepEvent::End { step: "sql_generation" });

        let generation_failed = outcome.sql_result.generation_failed;
        state.sql_result = Some(outcome.sql_result);

        if generation_failed {
            state.sql_validate_result = outcome.sql_validate_result;
            if state.hidden_context_retry_count < ctx.hidden_context_max_retry {
                run_hidden_context(ctx, &mut state, &rewritten_query).await;
                continue;
            }
            break;
        }

        emit(ctx, StepEvent::Start { step: "sql_validate" });
        let sql = state.sql_result.as_ref().unwrap().sql.clone();
        let validate_result = nodes::sql_validate::run(ctx.db, &sql).await;
        if validate_result.is_valid {
            log_step(ctx, "sql_validate", &sql, Ok(&validate_result)).await;
        } else {
            let err = crate::error::AppError::query(validate_result.error.clone().unwrap_or_default());
            log_step(ctx, "sql_validate", &sql, Err::<&state::SqlValidateResult, _>(&err)).await;
        }
        emit(ctx, StepEvent::End { step: "sql_validate" });

        let needs_retry = !validate_result.is_valid || validate_result.empty_result || validate_result.zero_metric_result;
        state.sql_validate_result = Some(validate_result);

        if needs_retry && state.hidden_context_retry_count < ctx.hidden_context_max_retry {
            run_hidden_context(ctx, &mut state, &rewritten_query).await;
            continue;
        }

        break;
    }

    finalize(ctx, state, export_timestamp).await
}

async fn run_hidden_context(ctx: &GraphContext<'_>, state: &mut GraphState, rewritten_query: &str) {
    emit(ctx, StepEvent::Start { step: "hidden_context" });
    let result = nodes::hidden_context::run(
        ctx.db,
        ctx.kb,
        rewritten_query,
        state.parse_result.as_ref(),
        state.sql_result.as_ref(),
        state.sql_validate_result.as_ref(),
        state.hidden_context_retry_count,
    )
    .await;
    log_step(ctx, "hidden_context", rewritten_query, Ok(&result)).await;
    emit(ctx, StepEvent::End { step: "hidden_context" });
    state.hidden_context_retry_count = result.retry_count;
    state.hidden_context_result = Some(result);
}

async fn finalize(ctx: &GraphContext<'_>, state: GraphState, export_timestamp: i64) -> Result<GraphState> {
    emit(ctx, StepEvent::Start { step: "result_return" });

    let intent = state
        .intent_result
        .as_ref()
        .map(|r| r.intent)
        .unwrap_or(Intent::Chat);
    let rewritten_query = state
        .intent_result
        .as_ref()
        .map(|r| r.rewritten_query.clone())
        .unwrap_or_else(|| state.message.clone());

    let input = nodes::result_return::ResultReturnInput {
        intent,
        user_query: &state.message,
        rewritten_query: &rewritten_query,
        parse_result: state.parse_result.as_ref(),
        sql_validate_result: state.sql_validate_result.as_ref(),
        hidden_context_retry_count: state.hidden_context_retry_count,
        model: &state.model_name,
        admin_id: ctx.admin_id,
        session_id: ctx.session_id,
    };

    let result = nodes::result_return::run(ctx.llm, ctx.kb, ctx.state_pool, ctx.export_dir, export_timestamp, input).await;

    let result = match result {
        Ok(r) => r,
        Err(e) => {
            emit(ctx, StepEvent::Error { step: "result_return", message: e.to_string() });
            return Err(e);
        }
    };

    emit(ctx, StepEvent::End { step: "result_return" });

    let mut state = state;
    state.result_return_result = Some(result);
    Ok(state)
}

/// Runs a node result through the per-step workflow log, then returns it
/// (or propagates its error) to the caller.
async fn log_and_propagate<T: serde::Serialize>(
    ctx: &GraphContext<'_>,
    step: &'static str,
    input_text: &str,
    result: Result<T>,
) -> Result<T> {
    match result {
        Ok(value) => {
            log_step(ctx, step, input_text, Ok(&value)).await;
            Ok(value)
        }
        Err(e) => {
            log_step(ctx, step, input_text, Err::<&T, _>(&e)).await;
            emit(ctx, StepEvent::Error { step, message: e.to_string() });
            Err(e)
        }
    }
}

async fn log_step<T: serde::Serialize>(
    ctx: &GraphContext<'_>,
    step: &str,
    input_text: &str,
    result: std::result::Result<&T, &crate::error::AppError>,
) {
    let (status, output, error_message) = match result {
        Ok(value) => (WorkflowStepStatus::Success, Some(value), None),
        Err(e) => (WorkflowStepStatus::Failed, None, Some(e.to_string())),
    };

    let input = serde_json::json!({ "input": input_text });
    let _ = crate::persistence::workflow_log::insert(
        ctx.state_pool,
        ctx.admin_id,
        ctx.session_id,
        step,
        &input,
        output,
        status,
        error_message.as_deref(),
    )
    .await;

    write_node_io_log(ctx, step, &input, output, status, error_message.as_deref());
}

/// Writes one local JSON snapshot file per node invocation, under
/// `<log_root>/<session_id>/<step>/YYYYMMDD-HH-MM-SS-ffffff-<status>.json`.
fn write_node_io_log<T: serde::Serialize>(
    ctx: &GraphContext<'_>,
    step: &str,
    input: &serde_json::Value,
    output: Option<&T>,
    status: WorkflowStepStatus,
    error_message: Option<&str>,
) {
    let dir = ctx.node_io_log_dir.join(ctx.session_id).join(step);
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }

    let now = chrono::Utc::now();
    let filename = format!("{}-{}.json", now.format("%Y%m%d-%H-%M-%S-%6f"), status.as_str());

    let snapshot = serde_json::json!({
        "input": input,
        "output": output.and_then(|v| serde_json::to_value(v).ok()),
        "status": status.as_str(),
        "error": error_message,
    });

    let _ = std::fs::write(dir.join(filename), serde_json::to_string_pretty(&snapshot).unwrap_or_default());
}

/// Convenience constructor for an initial [`GraphState`], reading the
/// request-scoped parameters callers pass at the HTTP layer.
pub fn new_state(message: String, history_user_messages: Vec<String>, threshold: f64, model_name: String) -> GraphState {
    GraphState::new(message, history_user_messages, threshold, model_name)
}

/// Arc-wrapped shared dependencies assembled once at startup and cloned
/// per-request by the HTTP handlers.
pub struct GraphDeps {
    pub kb: Arc<SchemaKnowledge>,
}
