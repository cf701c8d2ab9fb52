use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::stack::AuthSpec;
use crate::error::{GatewayError, Result};
use crate::rpc::ServerInfo;
use crate::tool::{CallResult, Tool};

use super::external_url::ExternalUrlTransport;
use super::sse_framing::SseFramer;
use super::stdio_framing::StdioFramer;
use super::{Transport, DEFAULT_CALL_TIMEOUT, HANDSHAKE_TIMEOUT};

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub host_port: Option<u16>,
}

/// The out-of-scope collaborator named in spec.md §1: image pull, lifecycle,
/// and attach, touched only at this interface boundary.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `force_pull` is the `--no-cache` CLI flag (spec.md §6): when true,
    /// always re-pull even if the image already exists locally.
    async fn ensure_image(&self, image: &str, force_pull: bool) -> Result<()>;
    async fn start(&self, image: &str, env: &BTreeMap<String, String>, container_port: Option<u16>) -> Result<ContainerHandle>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn attach(&self, id: &str) -> Result<(Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>)>;
    async fn exists(&self, id: &str) -> Result<bool>;
    async fn logs(&self, id: &str, lines: usize) -> Result<Vec<String>>;
    async fn networks(&self) -> Result<Vec<String>>;
}

/// A real (if minimal) Docker-backed implementation, since spec.md §1 asks
/// for the interface boundary to be real, not stubbed: gridctl only needs
/// image pull / start / stop / remove / attach / exists / logs / networks,
/// not a full orchestration stack.
pub struct BollardContainerRuntime {
    docker: Docker,
    next_host_port: AtomicU16,
}

impl BollardContainerRuntime {
    pub fn connect(base_port: u16) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| GatewayError::Fatal(format!("failed to connect to the container runtime: {e}")))?;
        Ok(BollardContainerRuntime { docker, next_host_port: AtomicU16::new(base_port) })
    }

    fn allocate_port(&self) -> u16 {
        self.next_host_port.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl ContainerRuntime for BollardContainerRuntime {
    async fn ensure_image(&self, image: &str, force_pull: bool) -> Result<()> {
        if !force_pull && self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions { from_image: image, ..Default::default() }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            item.map_err(|e| GatewayError::Transport(format!("image pull failed for '{image}': {e}")))?;
        }
        Ok(())
    }

    async fn start(&self, image: &str, env: &BTreeMap<String, String>, container_port: Option<u16>) -> Result<ContainerHandle> {
        let env_vec: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let (host_config, host_port) = if let Some(container_port) = container_port {
            let host_port = self.allocate_port();
            let mut port_bindings = std::collections::HashMap::new();
            port_bindings.insert(
                format!("{container_port}/tcp"),
                Some(vec![PortBinding { host_ip: Some("127.0.0.1".to_string()), host_port: Some(host_port.to_string()) }]),
            );
            (
                Some(HostConfig { port_bindings: Some(port_bindings), auto_remove: Some(false), ..Default::default() }),
                Some(host_port),
            )
        } else {
            (Some(HostConfig { auto_remove: Some(false), ..Default::default() }), None)
        };

        let config = Config {
            image: Some(image.to_string()),
            env: Some(env_vec),
            host_config,
            attach_stdin: Some(container_port.is_none()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(container_port.is_none()),
            tty: Some(false),
            ..Default::default()
        };

        let name = format!("gridctl-{}", uuid::Uuid::new_v4());
        let created = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
            .await
            .map_err(|e| GatewayError::Transport(format!("container create failed for '{image}': {e}")))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| GatewayError::Transport(format!("container start failed: {e}")))?;

        Ok(ContainerHandle { id: created.id, host_port })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 5 }))
            .await
            .map_err(|e| GatewayError::Transport(format!("container stop failed: {e}")))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
            .map_err(|e| GatewayError::Transport(format!("container remove failed: {e}")))
    }

    async fn attach(&self, id: &str) -> Result<(Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>)> {
        let result = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| GatewayError::Transport(format!("container attach failed: {e}")))?;

        let reader = Box::new(tokio_util::io::StreamReader::new(result.output.map(|item| {
            item.map(|chunk| bytes::Bytes::from(chunk.into_bytes()))
                .map_err(std::io::Error::other)
        })));
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(result.input);
        Ok((reader, writer))
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        match self.docker.inspect_container(id, None).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(GatewayError::Transport(format!("container inspect failed: {e}"))),
        }
    }

    async fn logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        use bollard::container::LogsOptions;
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> { stdout: true, stderr: true, tail: lines.to_string(), ..Default::default() }),
        );
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            if let Ok(chunk) = item {
                out.push(chunk.to_string());
            }
        }
        Ok(out)
    }

    async fn networks(&self) -> Result<Vec<String>> {
        let networks = self
            .docker
            .list_networks::<String>(None)
            .await
            .map_err(|e| GatewayError::Transport(format!("network list failed: {e}")))?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }
}

/// Used when gridctl runs without a reachable container runtime (e.g. in
/// tests, or a stack with no container-backed servers): every operation
/// fails with `Transport`, matching how a genuinely absent Docker daemon
/// would behave, rather than silently pretending to succeed.
pub struct NoopContainerRuntime;

#[async_trait]
impl ContainerRuntime for NoopContainerRuntime {
    async fn ensure_image(&self, _image: &str, _force_pull: bool) -> Result<()> {
        Err(GatewayError::Transport("no container runtime configured".to_string()))
    }
    async fn start(&self, _image: &str, _env: &BTreeMap<String, String>, _container_port: Option<u16>) -> Result<ContainerHandle> {
        Err(GatewayError::Transport("no container runtime configured".to_string()))
    }
    async fn stop(&self, _id: &str) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, _id: &str) -> Result<()> {
        Ok(())
    }
    async fn attach(&self, _id: &str) -> Result<(Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>)> {
        Err(GatewayError::Transport("no container runtime configured".to_string()))
    }
    async fn exists(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }
    async fn logs(&self, _id: &str, _lines: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn networks(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

struct ContainerSession {
    handle: ContainerHandle,
}

/// Starts a container exposing an HTTP JSON-RPC endpoint, then delegates the
/// actual protocol to `ExternalUrlTransport` against `127.0.0.1:<host_port>`.
pub struct ContainerHttpTransport {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    env: BTreeMap<String, String>,
    port: Option<u16>,
    auth: Option<AuthSpec>,
    no_cache: bool,
    session: Mutex<Option<(ContainerSession, ExternalUrlTransport)>>,
}

impl ContainerHttpTransport {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        image: String,
        env: BTreeMap<String, String>,
        port: Option<u16>,
        auth: Option<AuthSpec>,
        no_cache: bool,
    ) -> Self {
        ContainerHttpTransport { runtime, image, env, port, auth, no_cache, session: Mutex::new(None) }
    }

    async fn ensure_started(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.runtime.ensure_image(&self.image, self.no_cache).await?;
        let handle = self.runtime.start(&self.image, &self.env, self.port.or(Some(8080))).await?;
        let host_port = handle
            .host_port
            .ok_or_else(|| GatewayError::Fatal("container started without a published port".to_string()))?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let delegate = ExternalUrlTransport::new(format!("http://127.0.0.1:{host_port}/mcp"), self.auth.clone())?;
        *guard = Some((ContainerSession { handle }, delegate));
        Ok(())
    }
}

#[async_trait]
impl Transport for ContainerHttpTransport {
    async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo> {
        self.ensure_started().await?;
        let guard = self.session.lock().await;
        guard.as_ref().expect("started above").1.initialize(ctx).await
    }
    async fn list_tools(&self, ctx: CancellationToken) -> Result<Vec<Tool>> {
        let guard = self.session.lock().await;
        let (_, delegate) = guard.as_ref().ok_or_else(|| GatewayError::NotReady(self.image.clone()))?;
        delegate.list_tools(ctx).await
    }
    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        let guard = self.session.lock().await;
        let (_, delegate) = guard.as_ref().ok_or_else(|| GatewayError::NotReady(self.image.clone()))?;
        delegate.call_tool(ctx, name, args).await
    }
    async fn close(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if let Some((session, delegate)) = guard.take() {
            delegate.close().await.ok();
            self.runtime.stop(&session.handle.id).await.ok();
            self.runtime.remove(&session.handle.id).await.ok();
        }
        Ok(())
    }
    async fn ping(&self, ctx: CancellationToken) -> Result<()> {
        let guard = self.session.lock().await;
        let (_, delegate) = guard.as_ref().ok_or_else(|| GatewayError::NotReady(self.image.clone()))?;
        delegate.ping(ctx).await
    }
}

/// Starts a container exposing an SSE JSON-RPC endpoint, delegating to
/// `SseFramer` against `http://127.0.0.1:<host_port>/sse`.
pub struct ContainerSseTransport {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    env: BTreeMap<String, String>,
    port: Option<u16>,
    no_cache: bool,
    framer: SseFramer,
    session: Mutex<Option<ContainerSession>>,
}

impl ContainerSseTransport {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        image: String,
        env: BTreeMap<String, String>,
        port: Option<u16>,
        auth: Option<AuthSpec>,
        no_cache: bool,
    ) -> Self {
        ContainerSseTransport {
            runtime,
            image,
            env,
            port,
            no_cache,
            framer: SseFramer::new(auth).expect("SSE client construction cannot fail"),
            session: Mutex::new(None),
        }
    }

    async fn ensure_started(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.runtime.ensure_image(&self.image, self.no_cache).await?;
        let handle = self.runtime.start(&self.image, &self.env, self.port.or(Some(8080))).await?;
        let host_port = handle
            .host_port
            .ok_or_else(|| GatewayError::Fatal("container started without a published port".to_string()))?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.framer
            .connect(&format!("http://127.0.0.1:{host_port}/sse"), HANDSHAKE_TIMEOUT)
            .await?;
        *guard = Some(ContainerSession { handle });
        Ok(())
    }
}

#[async_trait]
impl Transport for ContainerSseTransport {
    async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo> {
        self.ensure_started().await?;
        let params = serde_json::json!({
            "protocolVersion": crate::rpc::MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "gridctl", "version": env!("CARGO_PKG_VERSION") },
        });
        let result = self.framer.request(ctx.clone(), "initialize", Some(params), HANDSHAKE_TIMEOUT).await?;
        self.framer.request(ctx, "notifications/initialized", None, HANDSHAKE_TIMEOUT).await.ok();
        let info: ServerInfo = result
            .get("serverInfo")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(ServerInfo { name: self.image.clone(), version: "0.0.0".to_string() });
        Ok(info)
    }
    async fn list_tools(&self, ctx: CancellationToken) -> Result<Vec<Tool>> {
        let result = self.framer.request(ctx, "tools/list", None, HANDSHAKE_TIMEOUT).await?;
        serde_json::from_value(result.get("tools").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| GatewayError::Protocol(format!("malformed tools/list result: {e}")))
    }
    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        let params = serde_json::json!({ "name": name, "arguments": args });
        let result = self.framer.request(ctx, "tools/call", Some(params), DEFAULT_CALL_TIMEOUT).await?;
        let content = serde_json::from_value(result.get("content").cloned().unwrap_or(Value::Array(vec![]))).unwrap_or_default();
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
        Ok(CallResult { content, is_error })
    }
    async fn close(&self) -> Result<()> {
        self.framer.close().await;
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            self.runtime.stop(&session.handle.id).await.ok();
            self.runtime.remove(&session.handle.id).await.ok();
        }
        Ok(())
    }
    async fn ping(&self, ctx: CancellationToken) -> Result<()> {
        self.framer.request(ctx, "ping", None, HANDSHAKE_TIMEOUT).await?;
        Ok(())
    }
}

/// Attaches to a container's hijacked stdin/stdout stream and frames it the
/// same way `LocalProcess` frames a subprocess pipe (spec.md §4.2).
pub struct ContainerStdioTransport {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    env: BTreeMap<String, String>,
    no_cache: bool,
    session: Mutex<Option<(ContainerSession, StdioFramer)>>,
}

impl ContainerStdioTransport {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, image: String, env: BTreeMap<String, String>, no_cache: bool) -> Self {
        ContainerStdioTransport { runtime, image, env, no_cache, session: Mutex::new(None) }
    }

    async fn ensure_started(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.runtime.ensure_image(&self.image, self.no_cache).await?;
        let handle = self.runtime.start(&self.image, &self.env, None).await?;
        let (reader, writer) = self.runtime.attach(&handle.id).await?;
        let image_for_log = self.image.clone();
        let framer = StdioFramer::spawn(reader, writer, move |line| {
            tracing::debug!(image = %image_for_log, "unmatched stdio line: {line}");
        });
        *guard = Some((ContainerSession { handle }, framer));
        Ok(())
    }
}

#[async_trait]
impl Transport for ContainerStdioTransport {
    async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo> {
        self.ensure_started().await?;
        let guard = self.session.lock().await;
        let (_, framer) = guard.as_ref().expect("started above");
        let params = serde_json::json!({
            "protocolVersion": crate::rpc::MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "gridctl", "version": env!("CARGO_PKG_VERSION") },
        });
        let result = framer.request(ctx.clone(), "initialize", Some(params), HANDSHAKE_TIMEOUT).await?;
        framer.notify("notifications/initialized", None).await.ok();
        let info: ServerInfo = result
            .get("serverInfo")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(ServerInfo { name: self.image.clone(), version: "0.0.0".to_string() });
        Ok(info)
    }
    async fn list_tools(&self, ctx: CancellationToken) -> Result<Vec<Tool>> {
        let guard = self.session.lock().await;
        let (_, framer) = guard.as_ref().ok_or_else(|| GatewayError::NotReady(self.image.clone()))?;
        let result = framer.request(ctx, "tools/list", None, HANDSHAKE_TIMEOUT).await?;
        serde_json::from_value(result.get("tools").cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| GatewayError::Protocol(format!("malformed tools/list result: {e}")))
    }
    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        let guard = self.session.lock().await;
        let (_, framer) = guard.as_ref().ok_or_else(|| GatewayError::NotReady(self.image.clone()))?;
        let params = serde_json::json!({ "name": name, "arguments": args });
        let result = framer.request(ctx, "tools/call", Some(params), DEFAULT_CALL_TIMEOUT).await?;
        let content = serde_json::from_value(result.get("content").cloned().unwrap_or(Value::Array(vec![]))).unwrap_or_default();
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
        Ok(CallResult { content, is_error })
    }
    async fn close(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if let Some((session, framer)) = guard.take() {
            framer.close().await;
            self.runtime.stop(&session.handle.id).await.ok();
            self.runtime.remove(&session.handle.id).await.ok();
        }
        Ok(())
    }
    async fn ping(&self, ctx: CancellationToken) -> Result<()> {
        let guard = self.session.lock().await;
        let (_, framer) = guard.as_ref().ok_or_else(|| GatewayError::NotReady(self.image.clone()))?;
        framer.request(ctx, "ping", None, HANDSHAKE_TIMEOUT).await?;
        Ok(())
    }
}
