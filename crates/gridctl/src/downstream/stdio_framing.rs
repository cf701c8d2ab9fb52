use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// One JSON-RPC message per line over a bidirectional byte stream, demultiplexed
/// by request id. Shared by `LocalProcess`, `SSH`, and `ContainerStdio` — the
/// three variants whose wire format is "line-delimited stdio" (spec.md §9's
/// "shared JSON-RPC framer with three framing strategies").
pub struct StdioFramer {
    next_id: AtomicI64,
    pending: PendingMap,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl StdioFramer {
    pub fn spawn<R, W>(reader: R, writer: W, on_log_line: impl Fn(String) + Send + 'static) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();

        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(&line) {
                            Ok(resp) => {
                                if let Some(id) = resp.id.as_i64() {
                                    if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                        let _ = tx.send(resp);
                                        continue;
                                    }
                                }
                                on_log_line(line);
                            }
                            Err(_) => on_log_line(line),
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            // stream closed: fail every outstanding waiter with Canceled by dropping senders.
            reader_pending.lock().await.clear();
        });

        StdioFramer {
            next_id: AtomicI64::new(1),
            pending,
            writer: Mutex::new(Box::new(writer)),
            reader_task,
        }
    }

    async fn write_line(&self, payload: &JsonRpcRequest) -> Result<()> {
        let mut line = serde_json::to_string(payload)
            .map_err(|e| GatewayError::Protocol(format!("failed to encode request: {e}")))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        writer.flush().await.map_err(|e| GatewayError::Transport(e.to_string()))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.write_line(&JsonRpcRequest::new(None, method, params)).await
    }

    pub async fn request(
        &self,
        ctx: CancellationToken,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self
            .write_line(&JsonRpcRequest::new(Some(Value::from(id)), method, params))
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Canceled)
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(timeout))
            }
            resp = rx => {
                match resp {
                    Ok(resp) => response_to_result(resp),
                    Err(_) => Err(GatewayError::Transport("stdio stream closed".to_string())),
                }
            }
        };
        result
    }

    pub async fn close(&self) {
        self.reader_task.abort();
        let mut pending = self.pending.lock().await;
        pending.clear();
    }
}

fn response_to_result(resp: JsonRpcResponse) -> Result<Value> {
    if let Some(err) = resp.error {
        return Err(GatewayError::Upstream { code: err.code, message: err.message });
    }
    Ok(resp.result.unwrap_or(Value::Null))
}
