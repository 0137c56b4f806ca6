//! `GET /api/chat/downloads/{file_name}` serves a previously exported CSV.
//!
//! Authenticated independently of the rest of the API: a bearer header or a
//! `?token=` query parameter both work, since this endpoint is often hit by
//! a plain browser navigation that can't set custom headers.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::auth::AuthUser;
use crate::http::AppState;

pub async fn download(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(file_name): Path<String>,
) -> Result<Response, (StatusCode, &'static str)> {
    let safe_name = FsPath::new(&file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if safe_name != file_name || !safe_name.to_lowercase().ends_with(".csv") {
        return Err((StatusCode::BAD_REQUEST, "Invalid file name"));
    }

    let expected_prefix = format!("admin_{}_", auth.admin_id);
    if !safe_name.starts_with(&expected_prefix) {
        return Err((StatusCode::FORBIDDEN, "No permission to download this file"));
    }

    let export_dir = &state.config.paths.chat_export_dir;
    let file_path = export_dir.join(safe_name);

    let canonical_dir = export_dir
        .canonicalize()
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found"))?;
    let canonical_file = file_path
        .canonicalize()
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found"))?;
    if !canonical_file.starts_with(&canonical_dir) {
        return Err((StatusCode::FORBIDDEN, "No permission to download this file"));
    }

    let bytes = tokio::fs::read(&canonical_file)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found"))?;

    let disposition = format!("attachment; filename=\"{safe_name}\"");

    let mut response = bytes.into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "text/csv; charset=utf-8".parse().unwrap());
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition.parse().unwrap());

    Ok(response)
}
