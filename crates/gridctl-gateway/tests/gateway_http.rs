//! End-to-end HTTP/SSE tests against a real bound listener, covering the
//! scenarios spec.md §8 spells out literally: stdio-style tool call via a
//! fake transport (A), access control over `/mcp` (B), and an SSE session
//! round-trip (C).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridctl::a2a::A2aSubsystem;
use gridctl::config::stack::{AgentSpec, Stack, ToolSelector};
use gridctl::downstream::{DownstreamClient, NoopContainerRuntime, Transport};
use gridctl::reload::ReloadEngine;
use gridctl::rpc::ServerInfo;
use gridctl::tool::{CallResult, Tool};
use gridctl::{Gateway, Router};
use gridctl_gateway::build_app;
use gridctl_gateway::state::AppState;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

struct MathTransport;

#[async_trait]
impl Transport for MathTransport {
    async fn initialize(&self, _ctx: CancellationToken) -> gridctl::Result<ServerInfo> {
        Ok(ServerInfo { name: "math".to_string(), version: "0.0.0".to_string() })
    }

    async fn list_tools(&self, _ctx: CancellationToken) -> gridctl::Result<Vec<Tool>> {
        Ok(vec![
            Tool { name: "add".to_string(), title: None, description: "adds".to_string(), input_schema: json!({}) },
            Tool { name: "echo".to_string(), title: None, description: "echoes".to_string(), input_schema: json!({}) },
        ])
    }

    async fn call_tool(&self, _ctx: CancellationToken, name: &str, args: Value) -> gridctl::Result<CallResult> {
        match name {
            "add" => {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(CallResult::text(format!("Result: {}", a + b)))
            }
            other => Ok(CallResult::text(format!("echo {other}"))),
        }
    }

    async fn close(&self) -> gridctl::Result<()> {
        Ok(())
    }

    async fn ping(&self, _ctx: CancellationToken) -> gridctl::Result<()> {
        Ok(())
    }
}

/// Builds a full gateway stack (router + one `math` server + a `restricted`
/// agent permitted only `math__add`) and starts it on an ephemeral port.
/// Returns the base URL once `/health` answers.
async fn spawn_test_gateway() -> String {
    let router = Arc::new(Router::new());
    let client = Arc::new(DownstreamClient::new("math", Arc::new(MathTransport), None));
    client.initialize(CancellationToken::new()).await.unwrap();
    router.add_client(client).await.unwrap();

    let gateway = Arc::new(Gateway::new(router.clone()));
    gateway
        .register_agent(
            "restricted",
            AgentSpec {
                uses: vec![ToolSelector { server: "math".to_string(), tools: Some(vec!["add".to_string()]) }],
                a2a: false,
                description: None,
            },
        )
        .await;

    let a2a = Arc::new(A2aSubsystem::new(gateway.clone(), "http://127.0.0.1:0".to_string()));

    let stack_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(stack_file.path(), "mcp_servers: {}\nagents: {}\n").unwrap();
    let reload = Arc::new(ReloadEngine::new(
        stack_file.path().to_path_buf(),
        Stack::default(),
        router.clone(),
        gateway.clone(),
        a2a.clone(),
        Arc::new(NoopContainerRuntime),
    ));
    // Keep the tempfile alive for the duration of the test process.
    std::mem::forget(stack_file);

    let state = AppState::new(gateway, a2a, reload, gridctl_gateway::state::LogBuffer::new(), None, "test-stack".to_string(), HashMap::new());
    state.mark_ready();

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn scenario_a_stdio_style_tool_call_via_mcp() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let list = client
        .post(format!("{base}/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    let names: Vec<&str> = list["result"]["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"math__add"));
    assert!(names.contains(&"math__echo"));

    let call = client
        .post(format!("{base}/mcp"))
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "math__add", "arguments": {"a": 2, "b": 3}}}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    let content = &call["result"]["content"][0];
    assert_eq!(content["type"], "text");
    assert_eq!(content["text"], "Result: 5");
}

#[tokio::test]
async fn scenario_b_access_control_over_mcp() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let list = client
        .post(format!("{base}/mcp"))
        .header("X-Gridctl-Agent", "restricted")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    let names: Vec<&str> = list["result"]["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["math__add"]);

    let denied = client
        .post(format!("{base}/mcp"))
        .header("X-Gridctl-Agent", "restricted")
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "math__echo", "arguments": {}}}))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert!(denied.get("error").is_some());
    assert_eq!(denied["error"]["code"], gridctl::error::GatewayError::PermissionDenied(String::new()).rpc_code());
}

#[tokio::test]
async fn scenario_c_sse_session_round_trip() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let mut response = client.get(format!("{base}/sse")).send().await.unwrap();
    let mut body = String::new();
    let session_id = loop {
        let chunk = response.chunk().await.unwrap().expect("sse stream closed before endpoint event");
        body.push_str(&String::from_utf8_lossy(&chunk));
        if let Some(idx) = body.find("sessionId=") {
            let rest = &body[idx + "sessionId=".len()..];
            let id: String = rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            if !id.is_empty() {
                break id;
            }
        }
    };

    let accepted = client
        .post(format!("{base}/message?sessionId={session_id}"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);

    let message_event = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let chunk = response.chunk().await.unwrap().expect("sse stream closed before message event");
            body.push_str(&String::from_utf8_lossy(&chunk));
            if body.contains("event: message") {
                break;
            }
        }
    })
    .await;
    assert!(message_event.is_ok(), "expected a message event within 1s");
    assert!(body.contains(r#""status":"ok""#));
}

#[tokio::test]
async fn unknown_session_id_yields_404() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/message?sessionId=does-not-exist"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn ready_and_health_always_reachable() {
    let base = spawn_test_gateway().await;
    let client = reqwest::Client::new();

    let ready = client.get(format!("{base}/ready")).send().await.unwrap();
    assert_eq!(ready.status(), 200);

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}
