//! Request authentication: extracts the caller's admin id from either a
//! `Authorization: Bearer <token>` header or a `?token=` query parameter.
//!
//! The query-parameter form exists for the CSV download endpoint, which is
//! typically hit from a plain browser navigation that can't set headers.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::{header, request::Parts, StatusCode};
use serde::Deserialize;

use crate::config::AuthConfig;

use super::jwt;

/// The authenticated caller, attached as an axum extractor.
pub struct AuthUser {
    pub admin_id: i64,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

impl<S> FromRequestParts<S> for AuthUser
where
    Arc<AuthConfig>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = Arc::<AuthConfig>::from_ref(state);

        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let token = match bearer {
            Some(token) => Some(token),
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|q| q.0.token),
        };

        let token = token.ok_or((StatusCode::UNAUTHORIZED, "missing bearer token"))?;
        jwt::decode_token(&token, &auth)
            .map(|admin_id| AuthUser { admin_id })
            .ok_or((StatusCode::UNAUTHORIZED, "invalid or expired token"))
    }
}
