use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::rpc::ServerInfo;
use crate::tool::{CallResult, Tool};

use super::local_process::LocalProcessTransport;
use super::Transport;

/// Tunnels the same line-delimited JSON-RPC protocol as `LocalProcess` through
/// `ssh user@host [-p port] [-i key] -- <command> [args...]`. Connection
/// liveness is tied to the ssh child process (spec.md §4.2).
pub struct SshTransport {
    inner: LocalProcessTransport,
}

impl SshTransport {
    pub fn new(
        host: String,
        user: String,
        port: Option<u16>,
        identity_file: Option<String>,
        command: String,
        args: Vec<String>,
    ) -> Self {
        let mut ssh_args = Vec::new();
        if let Some(port) = port {
            ssh_args.push("-p".to_string());
            ssh_args.push(port.to_string());
        }
        if let Some(identity) = identity_file {
            ssh_args.push("-i".to_string());
            ssh_args.push(identity);
        }
        ssh_args.push(format!("{user}@{host}"));
        ssh_args.push("--".to_string());
        ssh_args.push(command);
        ssh_args.extend(args);

        SshTransport {
            inner: LocalProcessTransport::new(
                "ssh".to_string(),
                ssh_args,
                Default::default(),
                std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from(".")),
            ),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn initialize(&self, ctx: CancellationToken) -> Result<ServerInfo> {
        self.inner.initialize(ctx).await
    }

    async fn list_tools(&self, ctx: CancellationToken) -> Result<Vec<Tool>> {
        self.inner.list_tools(ctx).await
    }

    async fn call_tool(&self, ctx: CancellationToken, name: &str, args: Value) -> Result<CallResult> {
        self.inner.call_tool(ctx, name, args).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn ping(&self, ctx: CancellationToken) -> Result<()> {
        self.inner.ping(ctx).await
    }
}
