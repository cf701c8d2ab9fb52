mod container_runtime;
mod external_url;
mod http_framing;
mod local_process;
mod openapi;
mod sse_framing;
mod ssh;
mod stdio_framing;

pub use container_runtime::{BollardContainerRuntime, ContainerRuntime, NoopContainerRuntime};
pub use external_url::ExternalUrlTransport;
pub use local_process::LocalProcessTransport;
pub use openapi::OpenApiTransport;
pub use ssh::SshTransport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::stack::McpServerSpec;
use crate::error::{GatewayError, Result};
use crate::rpc::ServerInfo;
use crate::tool::{CallResult, Tool};

/// The four operations every transport speaks, per spec.md §4.1. Implementations
/// never leak a transport-specific error type — only `GatewayError` kinds.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo>;
    async fn list_tools(&self, ctx: CancellationToken) -> Result<Vec<Tool>>;
    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult>;
    async fn close(&self) -> Result<()>;

    /// A `ping` JSON-RPC for MCP-speaking variants, a HEAD request for OpenAPI —
    /// each implementation picks the cheapest round-trip that proves liveness.
    async fn ping(&self, ctx: CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Health {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub error: Option<String>,
}

impl Default for Health {
    fn default() -> Self {
        Health {
            healthy: false,
            last_check: Utc::now(),
            error: None,
        }
    }
}

/// Wraps a transport with the common-contract bookkeeping spec.md §4.1 requires
/// of every variant: initialized flag, cached + whitelist-filtered tool catalog,
/// and health state. The router never touches a bare `Transport`.
pub struct DownstreamClient {
    pub name: String,
    transport: Arc<dyn Transport>,
    whitelist: Option<Vec<String>>,
    initialized: AtomicBool,
    tools: RwLock<Vec<Tool>>,
    health: RwLock<Health>,
}

impl DownstreamClient {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, whitelist: Option<Vec<String>>) -> Self {
        DownstreamClient {
            name: name.into(),
            transport,
            whitelist,
            initialized: AtomicBool::new(false),
            tools: RwLock::new(Vec::new()),
            health: RwLock::new(Health::default()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Performs the MCP handshake and populates the (whitelist-filtered) catalog.
    pub async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo> {
        let info = self.transport.initialize(ctx.clone()).await?;
        self.refresh_tools(ctx).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(info)
    }

    pub async fn refresh_tools(&self, ctx: CancellationToken) -> Result<()> {
        let fetched = self.transport.list_tools(ctx).await?;
        let filtered = match &self.whitelist {
            Some(allow) if !allow.is_empty() => fetched
                .into_iter()
                .filter(|t| allow.contains(&t.name))
                .collect(),
            _ => fetched,
        };
        *self.tools.write().await = filtered;
        Ok(())
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    /// Whether `name` survives the whitelist filter (if any) — filtered-out tools
    /// are not callable even if a caller names them directly, per spec.md §4.1.
    pub async fn is_callable(&self, name: &str) -> bool {
        self.tools.read().await.iter().any(|t| t.name == name)
    }

    /// Forwards a call, with the single-reinitialize-then-retry policy spec.md §7
    /// assigns to `Transport`/`Protocol` failures.
    pub async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        if !self.is_initialized() {
            return Err(GatewayError::NotReady(self.name.clone()));
        }
        if !self.is_callable(name).await {
            return Err(GatewayError::UnknownTool(name.to_string()));
        }
        match self.transport.call_tool(ctx.clone(), name, args.clone()).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_retryable_once() && !ctx.is_cancelled() => {
                self.transport.initialize(ctx.clone()).await?;
                self.transport.call_tool(ctx, name, args).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        self.transport.close().await
    }

    pub async fn ping(&self, ctx: CancellationToken) -> Health {
        let now = Utc::now();
        let health = match self.transport.ping(ctx).await {
            Ok(()) => Health {
                healthy: true,
                last_check: now,
                error: None,
            },
            Err(e) => Health {
                healthy: false,
                last_check: now,
                error: Some(e.to_string()),
            },
        };
        *self.health.write().await = health.clone();
        health
    }

    pub async fn health(&self) -> Health {
        self.health.read().await.clone()
    }
}

/// Default per-call deadline, per spec.md §5 ("120 s for tools/call").
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);
/// Default deadline for `ping`/`initialize`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the transport for a server spec. Container variants are wired to a
/// `ContainerRuntime` (spec.md §1 treats the runtime itself as out of scope,
/// touched only at this interface). `no_cache` is the `deploy --no-cache`
/// flag (spec.md §6): forces a fresh image pull instead of reusing whatever
/// is already present locally.
pub fn build_transport(
    spec: &McpServerSpec,
    working_dir: &std::path::Path,
    runtime: Arc<dyn ContainerRuntime>,
    no_cache: bool,
) -> Result<Arc<dyn Transport>> {
    match spec {
        McpServerSpec::ContainerHttp { image, env, port, auth, .. } => {
            Ok(Arc::new(container_runtime::ContainerHttpTransport::new(
                runtime,
                image.clone(),
                env.clone(),
                *port,
                auth.clone(),
                no_cache,
            )))
        }
        McpServerSpec::ContainerSse { image, env, port, auth, .. } => {
            Ok(Arc::new(container_runtime::ContainerSseTransport::new(
                runtime,
                image.clone(),
                env.clone(),
                *port,
                auth.clone(),
                no_cache,
            )))
        }
        McpServerSpec::ContainerStdio { image, env, .. } => Ok(Arc::new(
            container_runtime::ContainerStdioTransport::new(runtime, image.clone(), env.clone(), no_cache),
        )),
        McpServerSpec::LocalProcess { command, args, env, .. } => Ok(Arc::new(LocalProcessTransport::new(
            command.clone(),
            args.clone(),
            env.clone(),
            working_dir.to_path_buf(),
        ))),
        McpServerSpec::Ssh { host, user, port, identity_file, command, args, .. } => Ok(Arc::new(
            SshTransport::new(host.clone(), user.clone(), *port, identity_file.clone(), command.clone(), args.clone()),
        )),
        McpServerSpec::ExternalUrl { url, auth, .. } => {
            Ok(Arc::new(ExternalUrlTransport::new(url.clone(), auth.clone())?))
        }
        McpServerSpec::Openapi { spec, base_url, auth, include, exclude } => Ok(Arc::new(OpenApiTransport::new(
            spec.clone(),
            base_url.clone(),
            auth.clone(),
            include.clone(),
            exclude.clone(),
        )?)),
    }
}
