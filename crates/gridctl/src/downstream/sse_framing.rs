use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::stack::AuthSpec;
use crate::error::{GatewayError, Result};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Opens a long-lived `GET {base_url}` SSE stream, reads the first `endpoint`
/// event as the absolute POST URL for subsequent requests, then correlates
/// every later `data:` line by JSON-RPC id (spec.md §4.2's `ContainerSSE`).
pub struct SseFramer {
    client: Client,
    post_url: RwLock<Option<String>>,
    auth: Option<AuthSpec>,
    pending: PendingMap,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_id: AtomicI64,
}

impl SseFramer {
    pub fn new(auth: Option<AuthSpec>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to build SSE client: {e}")))?;
        Ok(SseFramer {
            client,
            post_url: RwLock::new(None),
            auth,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader_task: Mutex::new(None),
            next_id: AtomicI64::new(1),
        })
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(AuthSpec::Bearer { token_env }) => {
                if let Ok(token) = std::env::var(token_env) {
                    req = req.bearer_auth(token);
                }
            }
            Some(AuthSpec::Header { name, value_env }) => {
                if let Ok(value) = std::env::var(value_env) {
                    req = req.header(name, value);
                }
            }
            None => {}
        }
        req
    }

    /// Connects, waits for the `endpoint` event, then spawns the background
    /// reader that demultiplexes subsequent `message` events.
    pub async fn connect(&self, sse_url: &str, handshake_timeout: Duration) -> Result<()> {
        let req = self.apply_auth(self.client.get(sse_url));
        let response = tokio::time::timeout(handshake_timeout, req.send())
            .await
            .map_err(|_| GatewayError::Timeout(handshake_timeout))?
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!("SSE GET returned HTTP {}", response.status())));
        }

        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        let endpoint = loop {
            let chunk = tokio::time::timeout(handshake_timeout, stream.next())
                .await
                .map_err(|_| GatewayError::Timeout(handshake_timeout))?
                .ok_or_else(|| GatewayError::Protocol("SSE stream closed before endpoint event".to_string()))?
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            if let Some(event) = parse_next_event(&mut buf) {
                if event.name.as_deref() == Some("endpoint") {
                    break event.data;
                }
            }
        };
        *self.post_url.write().await = Some(endpoint);

        let pending = self.pending.clone();
        let task = tokio::spawn(async move {
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(event) = parse_next_event(&mut buf) {
                    if event.name.as_deref().unwrap_or("message") != "message" {
                        continue;
                    }
                    if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                        if let Some(id) = resp.id.as_i64() {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(resp);
                            }
                        }
                    }
                }
            }
            pending.lock().await.clear();
        });
        *self.reader_task.lock().await = Some(task);
        Ok(())
    }

    pub async fn request(
        &self,
        ctx: CancellationToken,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let url = self
            .post_url
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::NotReady("SSE endpoint not yet received".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let body = JsonRpcRequest::new(Some(Value::from(id)), method, params);
        let req = self.apply_auth(self.client.post(&url).json(&body));
        let send = req.send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                self.pending.lock().await.remove(&id);
                return Err(GatewayError::Canceled);
            }
            res = send => res,
        };
        let response = response.map_err(|e| GatewayError::Transport(e.to_string()))?;
        if response.status().as_u16() != 202 && !response.status().is_success() {
            self.pending.lock().await.remove(&id);
            return Err(GatewayError::Transport(format!("POST {url} returned HTTP {}", response.status())));
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Canceled)
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(timeout))
            }
            resp = rx => match resp {
                Ok(resp) => response_to_result(resp),
                Err(_) => Err(GatewayError::Transport("SSE stream closed".to_string())),
            },
        }
    }

    pub async fn close(&self) {
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.pending.lock().await.clear();
    }
}

fn response_to_result(resp: JsonRpcResponse) -> Result<Value> {
    if let Some(err) = resp.error {
        return Err(GatewayError::Upstream { code: err.code, message: err.message });
    }
    Ok(resp.result.unwrap_or(Value::Null))
}

struct SseEvent {
    name: Option<String>,
    data: String,
}

/// Pulls one complete `\n\n`-terminated SSE event out of `buf`, if present,
/// leaving any trailing partial event for the next chunk.
fn parse_next_event(buf: &mut String) -> Option<SseEvent> {
    let idx = buf.find("\n\n")?;
    let raw: String = buf.drain(..idx + 2).collect();
    let mut name = None;
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim().to_string());
        }
    }
    Some(SseEvent { name, data: data_lines.join("\n") })
}
