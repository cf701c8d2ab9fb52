use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

const BEARER_PREFIX: &str = "Bearer ";

/// Compares `Authorization: Bearer <token>` against the single configured
/// token (spec.md §6: "all handlers accept an optional bearer token ...
/// 401 otherwise when a token is configured"). `/ready` and `/health` are
/// exempt so an orchestrator's liveness probe never needs the token.
pub async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = &state.bearer_token else {
        return Ok(next.run(request).await);
    };
    if matches!(request.uri().path(), "/ready" | "/health") {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX));

    match provided {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
