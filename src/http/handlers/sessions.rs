//! Session listing, message listing, and soft-delete endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::http::{ApiError, AppState};
use crate::persistence::chat_history::{self, ChatHistoryRow, ChatSessionSummary};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct Meta {
    pub offset: i64,
    pub limit: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct ListEnvelope<T> {
    pub data: Vec<T>,
    pub meta: Meta,
}

#[derive(Debug, Serialize)]
pub struct OkEnvelope<T> {
    pub code: i32,
    pub message: &'static str,
    pub data: T,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(page): Query<PageQuery>,
) -> std::result::Result<Json<ListEnvelope<ChatSessionSummary>>, ApiError> {
    let (sessions, total) =
        chat_history::list_sessions(state.state_db.pool(), auth.admin_id, page.offset, page.limit).await?;
    Ok(Json(ListEnvelope {
        data: sessions,
        meta: Meta { offset: page.offset, limit: page.limit, total },
    }))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(session_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> std::result::Result<Json<ListEnvelope<ChatHistoryRow>>, ApiError> {
    let (messages, total) = chat_history::list_messages(
        state.state_db.pool(),
        auth.admin_id,
        &session_id,
        page.offset,
        page.limit,
    )
    .await?;
    Ok(Json(ListEnvelope {
        data: messages,
        meta: Meta { offset: page.offset, limit: page.limit, total },
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteOneResult {
    pub session_id: String,
    pub deleted: u64,
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<OkEnvelope<DeleteOneResult>>, axum::response::Response> {
    use axum::response::IntoResponse;

    match chat_history::delete_session(state.state_db.pool(), auth.admin_id, &session_id).await {
        Ok(deleted) => Ok(Json(OkEnvelope {
            code: 0,
            message: "ok",
            data: DeleteOneResult { session_id, deleted },
        })),
        Err(e) if e.to_string().contains("not found") => {
            Err((axum::http::StatusCode::NOT_FOUND, "Session not found").into_response())
        }
        Err(e) => Err(ApiError(e).into_response()),
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteAllResult {
    pub deleted: u64,
}

pub async fn clear_sessions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> std::result::Result<Json<OkEnvelope<DeleteAllResult>>, ApiError> {
    let deleted = chat_history::clear_sessions(state.state_db.pool(), auth.admin_id).await?;
    Ok(Json(OkEnvelope { code: 0, message: "ok", data: DeleteAllResult { deleted } }))
}
