use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use gridctl::rpc::JsonRpcRequest;
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::mcp_routes::{caller_from_headers, dispatch};
use crate::state::AppState;

/// `GET /sse` — opens a session and streams two kinds of events (spec.md
/// §4.4): an `endpoint` event carrying the `/message?sessionId=` URL the
/// client must POST to, then a `message` event per JSON-RPC response as the
/// session's outbound queue produces them.
pub async fn handle_sse(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (session, rx) = state.gateway.sessions.create().await;
    let endpoint = Event::default().event("endpoint").data(format!("/message?sessionId={}", session.id));

    let messages = ReceiverStream::new(rx).map(|response| {
        let data = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("message").data(data))
    });

    let stream = tokio_stream::once(Ok(endpoint)).chain(messages);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `POST /message?sessionId=` — enqueues the request's response onto the
/// session's SSE stream and answers `202 Accepted` immediately; `404` for an
/// unknown session id (spec.md §4.4).
pub async fn handle_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let Some(session) = state.gateway.sessions.get(&query.session_id).await else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "unknown session" }))).into_response();
    };
    session.touch().await;

    let caller = caller_from_headers(&headers);
    let state = state.clone();
    let session_for_task = session.clone();
    tokio::spawn(async move {
        if let Some(response) = dispatch(&state, caller.as_deref(), request).await {
            session_for_task.send(response).await;
        }
    });

    (StatusCode::ACCEPTED, Json(Value::Null)).into_response()
}
