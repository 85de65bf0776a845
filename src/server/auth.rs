use crate::server::error::ApiError;
use crate::server::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

pub async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    let Some(token) = bearer_token(req.headers()) else {
        warn!(path = %req.uri().path(), "request without bearer token");
        return Err(ApiError::Unauthorized);
    };
    if !state.tokens.verify(token).await {
        warn!(path = %req.uri().path(), "unauthorized request");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(req).await)
}
