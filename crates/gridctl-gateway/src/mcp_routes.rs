use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use gridctl::error::GatewayError;
use gridctl::gateway::AGENT_HEADER;
use gridctl::rpc::{JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub fn caller_from_headers(headers: &HeaderMap) -> Option<String> {
    headers.get(AGENT_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Dispatches one JSON-RPC request to the `Gateway`, shared by `/mcp`
/// (sync) and the SSE `/message` queue (spec.md §4.4). Returns `None` for
/// notifications, which expect no response.
pub async fn dispatch(state: &AppState, caller: Option<&str>, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    let id = request.id.clone();
    if request.is_notification() {
        // `notifications/initialized` and friends: acknowledged implicitly.
        return None;
    }
    let id = id.unwrap_or(Value::Null);

    let result = handle_method(state, caller, &request.method, request.params.clone()).await;
    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(id, &e),
    })
}

async fn handle_method(state: &AppState, caller: Option<&str>, method: &str, params: Option<Value>) -> Result<Value, GatewayError> {
    match method {
        "initialize" => Ok(serde_json::to_value(state.gateway.initialize()).expect("InitializeResult always serializes")),
        "ping" => Ok(state.gateway.ping()),
        "tools/list" => {
            let tools = state.gateway.tools_list(caller).await;
            Ok(serde_json::json!({ "tools": tools }))
        }
        "tools/call" => {
            let params = params.ok_or_else(|| GatewayError::Validation("tools/call requires params".to_string()))?;
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::Validation("tools/call requires params.name".to_string()))?;
            let args = params.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));
            let result = state.gateway.tools_call(CancellationToken::new(), caller, name, args).await?;
            serde_json::to_value(result).map_err(|e| GatewayError::Fatal(format!("failed to serialize call result: {e}")))
        }
        "prompts/list" => {
            let prompts = state.gateway.prompts_list().await;
            Ok(serde_json::json!({ "prompts": prompts }))
        }
        "prompts/get" => {
            let params = params.ok_or_else(|| GatewayError::Validation("prompts/get requires params".to_string()))?;
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::Validation("prompts/get requires params.name".to_string()))?;
            let result = state.gateway.prompts_get(name).await?;
            serde_json::to_value(result).map_err(|e| GatewayError::Fatal(format!("failed to serialize prompt: {e}")))
        }
        other => Err(GatewayError::UnknownTool(format!("method '{other}'"))),
    }
}

/// `POST /mcp` — synchronous JSON-RPC, no session state kept (spec.md §4.4).
pub async fn handle_mcp(State(state): State<AppState>, headers: HeaderMap, Json(request): Json<JsonRpcRequest>) -> Json<Value> {
    let caller = caller_from_headers(&headers);
    match dispatch(&state, caller.as_deref(), request).await {
        Some(response) => Json(serde_json::to_value(response).expect("JsonRpcResponse always serializes")),
        None => Json(Value::Null),
    }
}
