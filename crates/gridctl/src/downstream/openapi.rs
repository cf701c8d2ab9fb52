use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::expand::expand_env;
use crate::config::stack::AuthSpec;
use crate::error::{GatewayError, Result};
use crate::rpc::ServerInfo;
use crate::tool::{validate_raw_name, CallResult, Tool};

use super::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamLocation {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    location: ParamLocation,
    schema: Value,
}

#[derive(Debug, Clone)]
struct Operation {
    method: String,
    path_template: String,
    parameters: Vec<ParamSpec>,
    has_body: bool,
}

/// Parses an OpenAPI 3.x document's `paths`/`operations`/`parameters`/
/// `requestBody`/`servers` subset (spec.md §4.2) and proxies MCP tool calls
/// to HTTP requests against `base_url`. Treated as plain `serde_json`/
/// `serde_yaml` over that subset rather than a dedicated OpenAPI crate —
/// gridctl only needs operation-to-tool synthesis, not full spec validation
/// (SPEC_FULL.md §4).
pub struct OpenApiTransport {
    spec_location: String,
    base_url: String,
    auth: Option<AuthSpec>,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    client: Client,
    operations: RwLock<BTreeMap<String, Operation>>,
}

impl OpenApiTransport {
    pub fn new(
        spec_location: String,
        base_url: String,
        auth: Option<AuthSpec>,
        include: Option<Vec<String>>,
        exclude: Option<Vec<String>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to build OpenAPI HTTP client: {e}")))?;
        Ok(OpenApiTransport {
            spec_location,
            base_url,
            auth,
            include,
            exclude,
            client,
            operations: RwLock::new(BTreeMap::new()),
        })
    }

    fn included(&self, operation_id: &str) -> bool {
        if let Some(include) = &self.include {
            return include.iter().any(|i| i == operation_id);
        }
        if let Some(exclude) = &self.exclude {
            return !exclude.iter().any(|e| e == operation_id);
        }
        true
    }

    async fn load_document(&self) -> Result<Value> {
        let raw = if self.spec_location.starts_with("http://") || self.spec_location.starts_with("https://") {
            self.client
                .get(&self.spec_location)
                .send()
                .await
                .map_err(|e| GatewayError::Transport(format!("failed to fetch OpenAPI spec: {e}")))?
                .text()
                .await
                .map_err(|e| GatewayError::Transport(format!("failed to read OpenAPI spec body: {e}")))?
        } else {
            let contents = std::fs::read_to_string(&self.spec_location)
                .map_err(|e| GatewayError::Fatal(format!("failed to read OpenAPI spec file '{}': {e}", self.spec_location)))?;
            if std::env::var("GRIDCTL_NO_EXPAND").is_ok() {
                contents
            } else {
                expand_env(&contents).map_err(GatewayError::Fatal)?
            }
        };

        serde_json::from_str(&raw)
            .or_else(|_| serde_yaml::from_str(&raw).map_err(|e| GatewayError::Fatal(format!("malformed OpenAPI spec: {e}"))))
    }

    fn synthesize(&self, doc: &Value) -> Vec<(Tool, Operation)> {
        const METHODS: &[&str] = &["get", "put", "post", "delete", "patch", "options", "head"];
        let mut out = Vec::new();
        let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
            return out;
        };
        for (path, path_item) in paths {
            let Some(path_item) = path_item.as_object() else { continue };
            for method in METHODS {
                let Some(op) = path_item.get(*method) else { continue };
                let Some(operation_id) = op.get("operationId").and_then(Value::as_str) else { continue };
                if validate_raw_name(operation_id).is_err() || !self.included(operation_id) {
                    continue;
                }

                let mut properties = Map::new();
                let mut required = Vec::new();
                let mut parameters = Vec::new();

                if let Some(params) = op.get("parameters").and_then(Value::as_array) {
                    for p in params {
                        let Some(name) = p.get("name").and_then(Value::as_str) else { continue };
                        let location = match p.get("in").and_then(Value::as_str) {
                            Some("path") => ParamLocation::Path,
                            Some("query") => ParamLocation::Query,
                            Some("header") => ParamLocation::Header,
                            _ => continue,
                        };
                        let schema = p.get("schema").cloned().unwrap_or_else(|| serde_json::json!({"type": "string"}));
                        let is_required = p.get("required").and_then(Value::as_bool).unwrap_or(false)
                            || location == ParamLocation::Path;
                        properties.insert(name.to_string(), schema.clone());
                        if is_required {
                            required.push(name.to_string());
                        }
                        parameters.push(ParamSpec { name: name.to_string(), location, schema });
                    }
                }

                let has_body = op
                    .get("requestBody")
                    .and_then(|b| b.get("content"))
                    .and_then(|c| c.get("application/json"))
                    .is_some();
                if has_body {
                    let body_required = op.get("requestBody").and_then(|b| b.get("required")).and_then(Value::as_bool).unwrap_or(false);
                    properties.insert("body".to_string(), serde_json::json!({"type": "object"}));
                    if body_required {
                        required.push("body".to_string());
                    }
                }

                let description = op
                    .get("summary")
                    .or_else(|| op.get("description"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                let tool = Tool {
                    name: operation_id.to_string(),
                    title: None,
                    description,
                    input_schema: serde_json::json!({
                        "type": "object",
                        "properties": Value::Object(properties),
                        "required": required,
                    }),
                };
                let operation = Operation { method: method.to_string(), path_template: path.clone(), parameters, has_body };
                out.push((tool, operation));
            }
        }
        out
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
}

#[async_trait]
impl Transport for OpenApiTransport {
    async fn initialize(&self, _ctx: CancellationToken) -> Result<ServerInfo> {
        let doc = self.load_document().await?;
        let synthesized = self.synthesize(&doc);
        *self.operations.write().await = synthesized.into_iter().map(|(t, op)| (t.name.clone(), op)).collect();

        let title = doc.get("info").and_then(|i| i.get("title")).and_then(Value::as_str).unwrap_or("openapi").to_string();
        let version = doc.get("info").and_then(|i| i.get("version")).and_then(Value::as_str).unwrap_or("0.0.0").to_string();
        Ok(ServerInfo { name: title, version })
    }

    async fn list_tools(&self, _ctx: CancellationToken) -> Result<Vec<Tool>> {
        let doc = self.load_document().await?;
        Ok(self.synthesize(&doc).into_iter().map(|(t, _)| t).collect())
    }

    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        let operations = self.operations.read().await;
        let op = operations.get(name).ok_or_else(|| GatewayError::UnknownTool(name.to_string()))?;

        let mut path = op.path_template.clone();
        let mut query = Vec::new();
        let mut headers = Vec::new();

        for param in &op.parameters {
            let Some(value) = args.get(&param.name) else { continue };
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match param.location {
                ParamLocation::Path => {
                    path = path.replace(&format!("{{{}}}", param.name), &rendered);
                }
                ParamLocation::Query => query.push((param.name.clone(), rendered)),
                ParamLocation::Header => headers.push((param.name.clone(), rendered)),
            }
        }

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut req = self.client.request(
            op.method.parse().map_err(|_| GatewayError::Fatal(format!("invalid HTTP method '{}'", op.method)))?,
            &url,
        );
        req = self.apply_auth(req);
        if !query.is_empty() {
            req = req.query(&query);
        }
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if op.has_body {
            if let Some(body) = args.get("body") {
                req = req.json(body);
            }
        }

        let send = req.send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GatewayError::Canceled),
            res = send => res.map_err(|e| GatewayError::Transport(e.to_string()))?,
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::Upstream { code: status.as_u16() as i64, message: body });
        }
        Ok(CallResult::text(body))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, ctx: CancellationToken) -> Result<()> {
        let send = self.client.head(&self.base_url).send();
        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(GatewayError::Canceled),
            res = send => res.map_err(|e| GatewayError::Transport(e.to_string()))?,
        };
        if response.status().is_server_error() {
            return Err(GatewayError::Transport(format!("HEAD {} returned HTTP {}", self.base_url, response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesizes_tool_from_get_item_operation() {
        let transport = OpenApiTransport::new(
            "spec.json".to_string(),
            "http://localhost".to_string(),
            None,
            None,
            None,
        )
        .unwrap();
        let doc = serde_json::json!({
            "paths": {
                "/items/{id}": {
                    "get": {
                        "operationId": "getItem",
                        "parameters": [
                            {"name": "id", "in": "path", "required": true, "schema": {"type": "string"}}
                        ]
                    }
                }
            }
        });
        let synthesized = transport.synthesize(&doc);
        assert_eq!(synthesized.len(), 1);
        let (tool, op) = &synthesized[0];
        assert_eq!(tool.name, "getItem");
        assert_eq!(tool.input_schema["required"], serde_json::json!(["id"]));
        assert_eq!(op.path_template, "/items/{id}");
    }
}
