use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /api/status` — spec.md §6: stack name, uptime, server/agent names,
/// readiness.
pub async fn handle_status(State(state): State<AppState>) -> Json<Value> {
    let uptime = chrono::Utc::now().signed_duration_since(state.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "stack": state.stack_name,
        "uptimeSeconds": uptime,
        "servers": state.gateway.router.client_names().await,
        "agents": state.gateway.agent_names().await,
        "ready": state.is_ready(),
    }))
}

/// `GET /api/tools` — the unfiltered aggregated catalog, for operators
/// (spec.md §6).
pub async fn handle_tools(State(state): State<AppState>) -> Json<Value> {
    let tools = state.gateway.tools_list(None).await;
    Json(serde_json::json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_lines")]
    pub lines: usize,
    pub level: Option<String>,
}

fn default_lines() -> usize {
    200
}

/// `GET /api/logs?lines=&level=` — tails the in-memory ring buffer (spec.md
/// §6).
pub async fn handle_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let entries = state.logs.tail(query.lines, query.level.as_deref());
    Json(serde_json::json!({ "entries": entries }))
}

/// `POST /api/reload` — re-reads the stack file and applies the diff,
/// returning the same `ReloadReport` a file-watcher-triggered reload
/// produces (spec.md §4.7).
pub async fn handle_reload(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.reload.reload_from_disk().await?;
    Ok(Json(serde_json::to_value(report).expect("ReloadReport always serializes")))
}

/// `GET /ready` — 200 only once startup has attempted `initialize` on every
/// configured downstream, 503 otherwise (spec.md §4.8). Exempt from bearer
/// auth so an orchestrator's probe never needs the token.
pub async fn handle_ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "ready": false })))
    }
}

/// `GET /health` — 200 as soon as the process is listening, regardless of
/// downstream readiness (spec.md §4.8).
pub async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
