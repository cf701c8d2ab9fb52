use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::downstream::DownstreamClient;
use crate::error::{GatewayError, Result};
use crate::tool::{prefix_tool, split_prefixed, CallResult, Tool};

/// Owns the set of downstream clients and the aggregated, namespaced tool
/// catalog (spec.md §4.3). `AggregatedTools`/`Route` take the read lock;
/// `AddClient`/`RemoveClient`/`RefreshTools` take the write lock. Per-client
/// `CallTool` runs without the router lock held — callers clone an `Arc`
/// handle to the client before releasing the lock.
pub struct Router {
    clients: RwLock<BTreeMap<String, Arc<DownstreamClient>>>,
    catalog: RwLock<Vec<Tool>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router { clients: RwLock::new(BTreeMap::new()), catalog: RwLock::new(Vec::new()) }
    }

    /// Idempotent: replaces an existing client of the same name after closing it.
    pub async fn add_client(&self, client: Arc<DownstreamClient>) -> Result<()> {
        let name = client.name.clone();
        let previous = {
            let mut clients = self.clients.write().await;
            clients.insert(name, client)
        };
        if let Some(previous) = previous {
            previous.close().await?;
        }
        self.refresh_tools().await
    }

    pub async fn remove_client(&self, name: &str) -> Result<()> {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(name)
        };
        if let Some(removed) = removed {
            removed.close().await?;
        }
        self.refresh_tools().await
    }

    pub async fn client(&self, name: &str) -> Option<Arc<DownstreamClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn client_names(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Rebuilds the prefixed-name catalog: clients sorted by name (guaranteed
    /// by the `BTreeMap`), tools in each client's source order.
    pub async fn refresh_tools(&self) -> Result<()> {
        let clients = self.clients.read().await;
        let mut catalog = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (server_name, client) in clients.iter() {
            for tool in client.tools().await {
                let prefixed = prefix_tool(server_name, &tool)?;
                if !seen.insert(prefixed.name.clone()) {
                    tracing::warn!(name = %prefixed.name, "duplicate prefixed tool name after refresh");
                    continue;
                }
                catalog.push(prefixed);
            }
        }
        *self.catalog.write().await = catalog;
        Ok(())
    }

    pub async fn aggregated_tools(&self) -> Vec<Tool> {
        self.catalog.read().await.clone()
    }

    /// Splits on the first `__`; errors with `UnknownTool` if the prefix is
    /// unknown, per spec.md §4.3 (an unregistered server looks the same to a
    /// caller as an unregistered tool — both are "nothing answers to this name").
    pub async fn route(&self, prefixed_name: &str) -> Result<(Arc<DownstreamClient>, String)> {
        let (server, tool) = split_prefixed(prefixed_name)?;
        let client = self
            .client(server)
            .await
            .ok_or_else(|| GatewayError::UnknownTool(prefixed_name.to_string()))?;
        Ok((client, tool.to_string()))
    }

    pub async fn call(&self, ctx: CancellationToken, prefixed_name: &str, args: serde_json::Value) -> Result<CallResult> {
        let (client, tool_name) = self.route(prefixed_name).await?;
        client.call_tool(ctx, &tool_name, args).await
    }

    /// Closes every client, in preparation for shutdown.
    pub async fn close_all(&self) {
        let clients = { self.clients.read().await.values().cloned().collect::<Vec<_>>() };
        for client in clients {
            if let Err(e) = client.close().await {
                tracing::warn!(server = %client.name, error = %e, "error closing downstream client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::Transport;
    use async_trait::async_trait;
    use serde_json::Value;

    struct FakeTransport {
        tools: Vec<Tool>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn initialize(&self, _ctx: CancellationToken) -> Result<crate::rpc::ServerInfo> {
            Ok(crate::rpc::ServerInfo { name: "fake".into(), version: "0.0.0".into() })
        }
        async fn list_tools(&self, _ctx: CancellationToken) -> Result<Vec<Tool>> {
            Ok(self.tools.clone())
        }
        async fn call_tool(&self, _ctx: CancellationToken, name: &str, _args: Value) -> Result<CallResult> {
            Ok(CallResult::text(format!("called {name}")))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn ping(&self, _ctx: CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn tool(name: &str) -> Tool {
        Tool { name: name.to_string(), title: None, description: "d".to_string(), input_schema: serde_json::json!({}) }
    }

    async fn registered_client(name: &str, tools: Vec<Tool>) -> Arc<DownstreamClient> {
        let transport = Arc::new(FakeTransport { tools });
        let client = Arc::new(DownstreamClient::new(name, transport, None));
        client.initialize(CancellationToken::new()).await.unwrap();
        client
    }

    #[tokio::test]
    async fn aggregated_tools_are_prefixed_and_route_resolves_them() {
        let router = Router::new();
        router.add_client(registered_client("math", vec![tool("add")]).await).await.unwrap();

        let tools = router.aggregated_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "math__add");

        let (client, name) = router.route("math__add").await.unwrap();
        assert_eq!(client.name, "math");
        assert_eq!(name, "add");
    }

    #[tokio::test]
    async fn unknown_server_prefix_is_unknown_tool() {
        let router = Router::new();
        let err = router.route("ghost__add").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn re_adding_same_name_replaces_rather_than_duplicates() {
        let router = Router::new();
        router.add_client(registered_client("math", vec![tool("add")]).await).await.unwrap();
        router.add_client(registered_client("math", vec![tool("add"), tool("sub")]).await).await.unwrap();

        let tools = router.aggregated_tools().await;
        assert_eq!(tools.len(), 2);
        assert_eq!(router.client_names().await, vec!["math".to_string()]);
    }
}
