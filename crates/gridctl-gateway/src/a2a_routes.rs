use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use gridctl::a2a::{Message, Task};
use gridctl::error::GatewayError;
use gridctl::rpc::{JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /.well-known/agent.json` — the directory of every local A2A-enabled
/// agent's card (spec.md §4.6).
pub async fn handle_directory(State(state): State<AppState>) -> Json<Value> {
    let cards = state.a2a.directory(&state.agent_descriptions).await;
    Json(serde_json::json!({ "agents": cards }))
}

/// `GET /a2a/{agent}` — a single agent's card.
pub async fn handle_card(State(state): State<AppState>, Path(agent): Path<String>) -> Result<Json<Value>, ApiError> {
    let description = state.agent_descriptions.get(&agent).cloned().unwrap_or_default();
    let card = state.a2a.agent_card(&agent, &description).await?;
    Ok(Json(serde_json::to_value(card).expect("AgentCard always serializes")))
}

/// `POST /a2a/{agent}` — JSON-RPC: `message/send`, `tasks/get`, `tasks/cancel`
/// (spec.md §4.6).
pub async fn handle_rpc(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let id = request.id.clone().unwrap_or(Value::Null);
    let result = dispatch(&state, &agent, &request.method, request.params).await;
    let response = match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(id, &e),
    };
    (StatusCode::OK, Json(response))
}

async fn dispatch(state: &AppState, agent: &str, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
    match method {
        "message/send" => {
            let params = params.ok_or_else(|| GatewayError::Validation("message/send requires params".to_string()))?;
            let message: Message = serde_json::from_value(
                params.get("message").cloned().ok_or_else(|| GatewayError::Validation("message/send requires params.message".to_string()))?,
            )
            .map_err(|e| GatewayError::Validation(format!("invalid message: {e}")))?;
            let context_id = params.get("contextId").and_then(Value::as_str).map(str::to_string);
            let task: Task = state.a2a.message_send(agent, context_id, message).await?;
            serde_json::to_value(task).map_err(|e| GatewayError::Fatal(format!("failed to serialize task: {e}")))
        }
        "tasks/get" => {
            let task_id = task_id_param(&params)?;
            let task = state.a2a.tasks_get(agent, &task_id).await?;
            serde_json::to_value(task).map_err(|e| GatewayError::Fatal(format!("failed to serialize task: {e}")))
        }
        "tasks/cancel" => {
            let task_id = task_id_param(&params)?;
            let task = state.a2a.tasks_cancel(agent, &task_id).await?;
            serde_json::to_value(task).map_err(|e| GatewayError::Fatal(format!("failed to serialize task: {e}")))
        }
        other => Err(GatewayError::UnknownTool(format!("method '{other}'"))),
    }
}

fn task_id_param(params: &Option<Value>) -> Result<String, GatewayError> {
    params
        .as_ref()
        .and_then(|p| p.get("taskId"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Validation("request requires params.taskId".to_string()))
}
