//! HTTP service layer: shared app state, error mapping, and route wiring.

pub mod handlers;

use std::sync::Arc;

use axum::extract::FromRef;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{AuthConfig, Config};
use crate::db::DatabaseClient;
use crate::error::AppError;
use crate::llm::CompletionClient;
use crate::persistence::StateDb;
use crate::schema_kb::SchemaKnowledge;

/// Shared state handed to every request handler.
pub struct AppState {
    pub config: Config,
    pub auth: Arc<AuthConfig>,
    pub db: Box<dyn DatabaseClient>,
    pub llm: Box<dyn CompletionClient>,
    pub kb: Arc<SchemaKnowledge>,
    pub state_db: StateDb,
}

impl FromRef<Arc<AppState>> for Arc<AuthConfig> {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.auth.clone()
    }
}

/// Wraps [`AppError`] so it can be returned directly from a handler; maps
/// each variant to the HTTP status spec.md's error design assigns it.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::SqlUnsafe(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::Connection(_) | AppError::Persistence(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Llm(_) | AppError::Query(_) | AppError::NodeContract { .. } | AppError::Export(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = json!({
            "code": 1,
            "message": self.0.to_string(),
            "reason_code": self.0.reason_code(),
        });

        (status, Json(body)).into_response()
    }
}

/// Builds the full router: chat/sessions/downloads endpoints, CORS and
/// tracing layers, bound to `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let chat_routes = Router::new()
        .route("/api/chat", post(handlers::chat::chat_entry))
        .route("/api/chat/stream", post(handlers::chat::chat_stream_entry))
        .route("/api/chat/sessions", get(handlers::sessions::list_sessions))
        .route("/api/chat/sessions", delete(handlers::sessions::clear_sessions))
        .route(
            "/api/chat/sessions/{session_id}/messages",
            get(handlers::sessions::list_messages),
        )
        .route(
            "/api/chat/sessions/{session_id}",
            delete(handlers::sessions::delete_session),
        )
        .route("/api/chat/downloads/{file_name}", get(handlers::downloads::download));

    chat_routes
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
