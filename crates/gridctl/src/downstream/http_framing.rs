use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::stack::AuthSpec;
use crate::error::{GatewayError, Result};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// JSON-RPC request body POSTed to a URL, one request per HTTP round-trip.
/// Shared by `ContainerHTTP` and `ExternalURL` (spec.md §4.2).
pub struct HttpFramer {
    client: Client,
    url: String,
    auth: Option<AuthSpec>,
    next_id: AtomicI64,
}

impl HttpFramer {
    pub fn new(url: String, auth: Option<AuthSpec>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpFramer { client, url, auth, next_id: AtomicI64::new(1) })
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

    pub async fn request(
        &self,
        ctx: CancellationToken,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest::new(Some(Value::from(id)), method, params);

        let mut req = self.client.post(&self.url).json(&body).timeout(timeout);
        req = self.apply_auth(req);

        let send = req.send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GatewayError::Canceled),
            res = send => res.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(timeout)
                } else {
                    GatewayError::Transport(e.to_string())
                }
            })?,
        };

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("malformed JSON-RPC response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(GatewayError::Upstream { code: err.code, message: err.message });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}
