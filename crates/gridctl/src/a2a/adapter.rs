use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::downstream::Transport;
use crate::error::{GatewayError, Result};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, ServerInfo};
use crate::tool::{CallResult, ContentPart, Tool};

use super::card::{AgentCard, RemoteAuth};

const POLL_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const POLL_MAX_BACKOFF: Duration = Duration::from_secs(2);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Presents a remote A2A agent's skills as MCP tools named
/// `<peerName>__<skillId>` (spec.md §4.6: "remote A2A as MCP tools").
/// Registered with the `Router` under the peer's name like any other
/// downstream client, so it is called through the same `tools/call` path.
pub struct RemoteAgentAdapter {
    peer_name: String,
    endpoint: String,
    auth: Option<RemoteAuth>,
    client: Client,
}

impl RemoteAgentAdapter {
    pub fn new(peer_name: String, endpoint: String, auth: Option<RemoteAuth>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to build A2A client: {e}")))?;
        Ok(RemoteAgentAdapter { peer_name, endpoint, auth, client })
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(RemoteAuth::Bearer { token_env }) => {
                if let Ok(token) = std::env::var(token_env) {
                    req = req.bearer_auth(token);
                }
            }
            Some(RemoteAuth::ApiKey { header, value_env }) => {
                if let Ok(value) = std::env::var(value_env) {
                    req = req.header(header, value);
                }
            }
            None => {}
        }
        req
    }

    async fn fetch_card(&self, ctx: CancellationToken) -> Result<AgentCard> {
        let url = format!("{}/.well-known/agent.json", self.endpoint.trim_end_matches('/'));
        let req = self.apply_auth(self.client.get(&url));
        let send = req.send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GatewayError::Canceled),
            res = send => res.map_err(|e| GatewayError::Transport(e.to_string()))?,
        };
        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!("GET {url} returned HTTP {}", response.status())));
        }
        response.json().await.map_err(|e| GatewayError::Protocol(format!("malformed agent card: {e}")))
    }

    async fn rpc(&self, ctx: CancellationToken, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let body = JsonRpcRequest::new(Some(Value::from(1)), method, Some(params));
        let req = self.apply_auth(self.client.post(&self.endpoint).json(&body).timeout(timeout));
        let send = req.send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GatewayError::Canceled),
            res = send => res.map_err(|e| {
                if e.is_timeout() { GatewayError::Timeout(timeout) } else { GatewayError::Transport(e.to_string()) }
            })?,
        };
        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!("A2A POST returned HTTP {}", response.status())));
        }
        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("malformed A2A JSON-RPC response: {e}")))?;
        if let Some(err) = parsed.error {
            return Err(GatewayError::Upstream { code: err.code, message: err.message });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Transport for RemoteAgentAdapter {
    async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo> {
        let card = self.fetch_card(ctx).await?;
        Ok(ServerInfo { name: card.name, version: card.version })
    }

    async fn list_tools(&self, ctx: CancellationToken) -> Result<Vec<Tool>> {
        let card = self.fetch_card(ctx).await?;
        Ok(card
            .skills
            .into_iter()
            .map(|skill| Tool {
                name: skill.id,
                title: Some(skill.name),
                description: skill.description,
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": { "message": { "type": "string" } },
                    "required": ["message"],
                }),
            })
            .collect())
    }

    /// Issues `message/send`, then polls `tasks/get` until a terminal
    /// status with exponential backoff capped around 2s (spec.md §4.6),
    /// returning the final artifacts as MCP content.
    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        let text = args.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let params = serde_json::json!({
            "message": { "role": "user", "text": text },
            "skillId": name,
        });
        let sent = self.rpc(ctx.clone(), "message/send", params, HANDSHAKE_TIMEOUT).await?;
        let task_id = sent
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Protocol("message/send result missing task id".to_string()))?
            .to_string();

        let mut backoff = POLL_INITIAL_BACKOFF;
        loop {
            if ctx.is_cancelled() {
                return Err(GatewayError::Canceled);
            }
            let result = self
                .rpc(ctx.clone(), "tasks/get", serde_json::json!({ "id": task_id }), HANDSHAKE_TIMEOUT)
                .await?;
            let status = result.get("status").and_then(Value::as_str).unwrap_or("");
            let terminal = matches!(status, "completed" | "failed" | "canceled");
            if terminal {
                let content = result
                    .get("artifacts")
                    .and_then(Value::as_array)
                    .map(|artifacts| {
                        artifacts
                            .iter()
                            .flat_map(|a| a.get("parts").and_then(Value::as_array).cloned().unwrap_or_default())
                            .filter_map(|part| part.get("text").and_then(Value::as_str).map(|t| ContentPart::Text { text: t.to_string() }))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                return Ok(CallResult { content, is_error: status == "failed" });
            }
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(GatewayError::Canceled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(POLL_MAX_BACKOFF);
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, ctx: CancellationToken) -> Result<()> {
        self.fetch_card(ctx).await.map(|_| ())
    }
}

