use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::stack::AuthSpec;
use crate::error::{GatewayError, Result};
use crate::rpc::{ServerInfo, MCP_PROTOCOL_VERSION};
use crate::tool::{CallResult, ContentPart, Tool};

use super::http_framing::HttpFramer;
use super::{Transport, DEFAULT_CALL_TIMEOUT, HANDSHAKE_TIMEOUT};

/// A plain HTTP JSON-RPC MCP server reachable at a fixed URL, not backed by a
/// gridctl-managed container. Also the transport `ContainerHTTP` delegates to
/// once the container's host port is known.
pub struct ExternalUrlTransport {
    framer: HttpFramer,
}

impl ExternalUrlTransport {
    pub fn new(url: String, auth: Option<AuthSpec>) -> Result<Self> {
        Ok(ExternalUrlTransport { framer: HttpFramer::new(url, auth)? })
    }
}

#[async_trait]
impl Transport for ExternalUrlTransport {
    async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "gridctl", "version": env!("CARGO_PKG_VERSION") },
        });
        let result = self
            .framer
            .request(ctx.clone(), "initialize", Some(params), HANDSHAKE_TIMEOUT)
            .await?;
        self.framer
            .request(ctx, "notifications/initialized", None, HANDSHAKE_TIMEOUT)
            .await
            .ok();

        let info: ServerInfo = result
            .get("serverInfo")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(ServerInfo { name: "unknown".to_string(), version: "0.0.0".to_string() });
        Ok(info)
    }

    async fn list_tools(&self, ctx: CancellationToken) -> Result<Vec<Tool>> {
        let result = self
            .framer
            .request(ctx, "tools/list", None, HANDSHAKE_TIMEOUT)
            .await?;
        let tools: Vec<Tool> = serde_json::from_value(result.get("tools").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| GatewayError::Protocol(format!("malformed tools/list result: {e}")))?;
        Ok(tools)
    }

    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        let params = serde_json::json!({ "name": name, "arguments": args });
        let result = self
            .framer
            .request(ctx, "tools/call", Some(params), DEFAULT_CALL_TIMEOUT)
            .await?;
        let content: Vec<ContentPart> = serde_json::from_value(result.get("content").cloned().unwrap_or(Value::Array(vec![])))
            .unwrap_or_default();
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
        Ok(CallResult { content, is_error })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, ctx: CancellationToken) -> Result<()> {
        self.framer.request(ctx, "ping", None, HANDSHAKE_TIMEOUT).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn initialize_list_tools_and_call_tool_round_trip() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"serverInfo": {"name": "math", "version": "1.0.0"}},
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 2, "result": {},
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "result": {"tools": [{"name": "add", "description": "adds", "inputSchema": {}}]},
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 4,
                "result": {"content": [{"type": "text", "text": "Result: 5"}]},
            })))
            .mount(&server)
            .await;

        let transport = ExternalUrlTransport::new(server.uri(), None).unwrap();
        let ctx = CancellationToken::new();

        let info = transport.initialize(ctx.clone()).await.unwrap();
        assert_eq!(info.name, "math");

        let tools = transport.list_tools(ctx.clone()).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "add");

        let result = transport
            .call_tool(ctx, "add", serde_json::json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        match &result.content[0] {
            ContentPart::Text { text } => assert_eq!(text, "Result: 5"),
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upstream_json_rpc_error_is_surfaced_as_upstream_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32010, "message": "bad args"},
            })))
            .mount(&server)
            .await;

        let transport = ExternalUrlTransport::new(server.uri(), None).unwrap();
        let err = transport
            .call_tool(CancellationToken::new(), "add", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { code: -32010, .. }));
    }
}
