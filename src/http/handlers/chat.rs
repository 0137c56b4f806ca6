//! `POST /api/chat` and `POST /api/chat/stream`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::graph::{self, GraphContext, StepEvent};
use crate::http::{ApiError, AppState};
use crate::persistence::chat_history;
use crate::streaming::{self, StreamItem};

/// Number of prior user turns loaded as follow-up context for intent
/// recognition, matching the source service's fixed window.
const HISTORY_WINDOW: i64 = 4;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
    pub model_name: Option<String>,
}

/// The full per-turn result returned to the client, covering both the
/// intent phase and (when the intent routes through the rest of the graph)
/// the final result-return outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponseData {
    pub session_id: String,
    pub intent: String,
    pub is_followup: bool,
    pub confidence: f64,
    pub merged_query: String,
    pub rewritten_query: String,
    /// `true` when the graph short-circuited at intent recognition
    /// (`intent = chat`) without running task_parse/sql_generation/etc.
    pub skipped: bool,
    pub task: Option<crate::graph::state::TaskParseResult>,
    pub final_status: String,
    pub reason_code: String,
    pub summary: String,
    pub assistant_reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiEnvelope<T> {
    pub code: i32,
    pub message: &'static str,
    pub data: T,
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(16).collect()
}

/// Runs one full turn of the graph and assembles the response DTO. Shared
/// by the sync and (sync-mode) streaming entry points.
async fn run_chat_turn(
    state: &AppState,
    admin_id: i64,
    payload: ChatRequest,
    events: Option<tokio::sync::mpsc::UnboundedSender<StepEvent>>,
) -> Result<ChatResponseData> {
    if payload.message.trim().is_empty() {
        return Err(AppError::config("message must not be empty"));
    }

    let session_id = payload.session_id.unwrap_or_else(new_session_id);
    let history_user_messages =
        chat_history::recent_user_messages(state.state_db.pool(), admin_id, &session_id, HISTORY_WINDOW).await?;

    let threshold = state.config.workflow.intent_confidence_threshold;
    let model_name = payload
        .model_name
        .unwrap_or_else(|| state.config.llm.model_intent.clone());

    let graph_state = graph::new_state(payload.message, history_user_messages, threshold, model_name);

    let ctx = GraphContext {
        llm: &*state.llm,
        db: &*state.db,
        kb: &state.kb,
        state_pool: state.state_db.pool(),
        export_dir: &state.config.paths.chat_export_dir,
        node_io_log_dir: &state.config.paths.node_io_log_dir,
        admin_id,
        session_id: &session_id,
        events,
        hidden_context_max_retry: state.config.workflow.hidden_context_max_retry,
    };

    let export_timestamp = chrono::Utc::now().timestamp();
    let result_state = graph::run(&ctx, graph_state, export_timestamp).await?;

    let task = result_state.parse_result;
    let intent_result = result_state
        .intent_result
        .ok_or_else(|| AppError::internal("graph run finished without an intent result"))?;
    let result_return = result_state
        .result_return_result
        .ok_or_else(|| AppError::internal("graph run finished without a result-return outcome"))?;

    Ok(ChatResponseData {
        session_id,
        intent: intent_result.intent.as_str().to_string(),
        is_followup: intent_result.is_followup,
        confidence: intent_result.confidence,
        merged_query: intent_result.merged_query,
        rewritten_query: intent_result.rewritten_query,
        skipped: result_return.skipped,
        task,
        final_status: result_return.final_status.as_str().to_string(),
        reason_code: result_return.reason_code,
        summary: result_return.summary,
        assistant_reply: result_return.assistant_reply,
        download_url: result_return.download_url,
    })
}

pub async fn chat_entry(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(payload): Json<ChatRequest>,
) -> std::result::Result<Json<ApiEnvelope<ChatResponseData>>, ApiError> {
    let data = run_chat_turn(&state, auth.admin_id, payload, None).await?;
    Ok(Json(ApiEnvelope { code: 0, message: "ok", data }))
}

pub async fn chat_stream_entry(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(payload): Json<ChatRequest>,
) -> std::result::Result<axum::response::Response, ApiError> {
    if state.config.paths.chat_stream_mode == "sync" {
        let data = run_chat_turn(&state, auth.admin_id, payload, None).await?;
        return Ok(Json(ApiEnvelope { code: 0, message: "ok", data }).into_response());
    }

    let session_id = payload.session_id.clone().unwrap_or_else(new_session_id);
    let (tx, rx) = streaming::channel();
    let (step_tx, mut step_rx) = tokio::sync::mpsc::unbounded_channel::<StepEvent>();

    let admin_id = auth.admin_id;
    let state_for_task = state.clone();
    let stream_session_id = session_id.clone();

    tokio::spawn(async move {
        let _ = tx.send(StreamItem::WorkflowStart);

        let forward_tx = tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(ev) = step_rx.recv().await {
                if forward_tx.send(StreamItem::Step(ev)).is_err() {
                    break;
                }
            }
        });

        let mut request = payload;
        request.session_id = Some(stream_session_id);

        let result = run_chat_turn(&state_for_task, admin_id, request, Some(step_tx)).await;
        let _ = forward.await;

        match result {
            Ok(data) => {
                let _ = tx.send(StreamItem::WorkflowEnd(data));
            }
            Err(e) => {
                let _ = tx.send(StreamItem::WorkflowError(e.to_string()));
            }
        }
    });

    let body = streaming::event_stream(session_id, rx);
    let sse = Sse::new(body);
    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert("X-Accel-Buffering", axum::http::HeaderValue::from_static("no"));
    Ok(response)
}
