use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;
use gridctl::a2a::A2aSubsystem;
use gridctl::config::{Paths, Stack};
use gridctl::daemon::{DaemonState, ForkOutcome, LifecycleController, DEFAULT_READY_TIMEOUT};
use gridctl::downstream::{build_transport, BollardContainerRuntime, ContainerRuntime, DownstreamClient, NoopContainerRuntime};
use gridctl::health::HealthSupervisor;
use gridctl::reload::ReloadEngine;
use gridctl::router::Router;
use gridctl::{Gateway, GatewayError};
use gridctl_gateway::{AppState, LogBuffer, LogLayer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_BASE_PORT: u16 = 9000;

/// Command-line entry point (spec.md §6): `deploy|destroy|status|reload|link|unlink`.
#[derive(Parser)]
#[command(name = "gridctl", about = "Orchestrates a fleet of MCP servers and agents behind a single gateway endpoint")]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploys a stack, starting every server/agent/resource it declares.
    Deploy {
        stack: PathBuf,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
        base_port: u16,
        #[arg(long)]
        foreground: bool,
        #[arg(long)]
        no_cache: bool,
        #[arg(long)]
        no_expand: bool,
        #[arg(long)]
        watch: bool,
    },
    /// Tears down a running stack.
    Destroy { stack: String },
    /// Lists every known stack and whether it's running.
    Status,
    /// Triggers a reload on a running stack.
    Reload { stack: String },
    /// Writes gridctl's MCP endpoint into an LLM client's config file.
    Link { stack: String, client_config: PathBuf },
    /// Removes gridctl's entry from an LLM client's config file.
    Unlink { stack: String, client_config: PathBuf },
    /// Internal: runs as the detached daemon child after `fork_and_detach`.
    #[command(hide = true)]
    DaemonChild {
        stack: PathBuf,
        port: u16,
        base_port: u16,
        #[arg(long)]
        no_expand: bool,
        #[arg(long)]
        watch: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logs = LogBuffer::new();
    init_tracing(cli.verbose, cli.quiet, logs.clone());

    match cli.command {
        Command::Deploy { stack, port, base_port, foreground, no_cache, no_expand, watch } => {
            deploy(stack, port, base_port, foreground, no_cache, no_expand, watch, logs)
        }
        Command::DaemonChild { stack, port, base_port, no_expand, watch } => {
            run_tokio(async move { run_gateway(stack, port, base_port, false, no_expand, watch, None, logs).await })
        }
        Command::Destroy { stack } => run_tokio(async move { destroy(&stack).await }),
        Command::Status => status(),
        Command::Reload { stack } => run_tokio(async move { reload(&stack).await }),
        Command::Link { stack, client_config } => link(&stack, &client_config, true),
        Command::Unlink { stack, client_config } => link(&stack, &client_config, false),
    }
}

/// Installs the `fmt` layer (stdout) alongside `LogLayer` (the in-memory
/// ring `GET /api/logs` reads from, spec.md §6) on one shared registry, so
/// both see the same filtered event stream.
fn init_tracing(verbose: bool, quiet: bool, logs: Arc<LogBuffer>) {
    let filter = if quiet {
        "gridctl=error"
    } else if verbose {
        "gridctl=debug,gridctl_gateway=debug,tower_http=debug"
    } else {
        "gridctl=info,gridctl_gateway=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogLayer::new(logs))
        .try_init();
}

fn run_tokio<F: std::future::Future<Output = ExitCode>>(fut: F) -> ExitCode {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(fut),
        Err(e) => {
            eprintln!("{}: failed to start async runtime: {e}", style("error").red());
            ExitCode::from(1)
        }
    }
}

fn stack_name_of(stack: &Path) -> String {
    stack.file_stem().and_then(|s| s.to_str()).unwrap_or("stack").to_string()
}

/// `deploy` (spec.md §4.8). Forking must happen before any tokio runtime
/// exists in this process, so this function stays fully synchronous up to
/// the point it either `exec`s a runtime directly (foreground) or forks and
/// lets each half build its own runtime independently.
fn deploy(
    stack: PathBuf,
    port: Option<u16>,
    base_port: u16,
    foreground: bool,
    no_cache: bool,
    no_expand: bool,
    watch: bool,
    logs: Arc<LogBuffer>,
) -> ExitCode {
    let Ok(stack_path) = stack.canonicalize() else {
        eprintln!("{}: stack file '{}' not found", style("error").red(), stack.display());
        return ExitCode::from(3);
    };
    let stack_name = stack_name_of(&stack_path);

    if no_expand {
        std::env::set_var("GRIDCTL_NO_EXPAND", "1");
    }

    let controller = match LifecycleController::new() {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let lock = match controller.prepare_deploy(&stack_name) {
        Ok(lock) => lock,
        Err(e @ GatewayError::Conflict(_)) => {
            eprintln!("{}: {e}", style("error").red());
            return ExitCode::from(2);
        }
        Err(e) => return fail(&e),
    };

    let chosen_port = port.unwrap_or(DEFAULT_PORT);

    if foreground {
        let code = run_tokio(async move {
            run_gateway(stack_path, chosen_port, base_port, no_cache, no_expand, watch, Some(stack_name), logs).await
        });
        drop(lock);
        return code;
    }

    // SAFETY: no other threads have been started yet; this process hasn't
    // initialized a tokio runtime (spec.md §4.8's fork/detach sequencing).
    let outcome = unsafe { gridctl::daemon::process::fork_and_detach(&Paths::log_file(&stack_name)) };
    match outcome {
        Ok(ForkOutcome::Child) => {
            // The lock's file descriptor survives the fork; the child keeps
            // holding it for the rest of this process's life.
            std::mem::forget(lock);
            run_tokio(async move {
                run_gateway(stack_path, chosen_port, base_port, no_cache, no_expand, watch, Some(stack_name), logs).await
            })
        }
        Ok(ForkOutcome::Parent { child_pid }) => {
            drop(lock);
            run_tokio(async move { await_daemon_ready(&stack_name_of(&stack), child_pid, chosen_port).await })
        }
        Err(e) => fail(&e),
    }
}

async fn await_daemon_ready(stack_name: &str, child_pid: i32, port: u16) -> ExitCode {
    let controller = match LifecycleController::new() {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let base_url = format!("http://127.0.0.1:{port}");
    match controller.wait_ready(&base_url, DEFAULT_READY_TIMEOUT).await {
        Ok(()) => {
            println!(
                "{} stack '{stack_name}' deployed (pid {child_pid}, port {port}) — {base_url}/mcp",
                style("success").green()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!(
                "{}: daemon did not become ready within {:?}: {e} (see {})",
                style("error").red(),
                DEFAULT_READY_TIMEOUT,
                Paths::log_file(stack_name).display()
            );
            ExitCode::from(1)
        }
    }
}

/// Builds every component and serves, following the construction order
/// spec.md §9 requires for the cyclic agent-uses-agent case: gateway
/// created, A2A registered, local agents added, A2A adapters registered
/// last, then `RefreshTools`.
async fn run_gateway(
    stack_path: PathBuf,
    port: u16,
    base_port: u16,
    no_cache: bool,
    no_expand: bool,
    watch: bool,
    write_state_as: Option<String>,
    logs: Arc<LogBuffer>,
) -> ExitCode {
    if no_expand {
        std::env::set_var("GRIDCTL_NO_EXPAND", "1");
    }
    if let Err(e) = Paths::ensure_dirs() {
        eprintln!("{}: failed to prepare ~/.gridctl: {e}", style("error").red());
        return ExitCode::from(1);
    }

    let contents = match std::fs::read_to_string(&stack_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: failed to read stack file: {e}", style("error").red());
            return ExitCode::from(3);
        }
    };
    let stack = match Stack::parse_yaml(&contents) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: invalid stack file: {e}", style("error").red());
            return ExitCode::from(3);
        }
    };

    let working_dir = stack_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let runtime: Arc<dyn ContainerRuntime> = match BollardContainerRuntime::connect(base_port) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::warn!(error = %e, "no container runtime reachable; container-backed servers will fail to start");
            Arc::new(NoopContainerRuntime)
        }
    };

    let router = Arc::new(Router::new());
    let gateway = Arc::new(Gateway::new(router.clone()));
    let base_url = format!("http://127.0.0.1:{port}");
    let a2a = Arc::new(A2aSubsystem::new(gateway.clone(), base_url));

    for (name, spec) in &stack.mcp_servers {
        let transport = match build_transport(spec, &working_dir, runtime.clone(), no_cache) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(server = %name, error = %e, "failed to build transport");
                continue;
            }
        };
        let client = Arc::new(DownstreamClient::new(name.clone(), transport, spec.whitelist().cloned()));
        if let Err(e) = client.initialize(CancellationToken::new()).await {
            tracing::error!(server = %name, error = %e, "initial handshake failed; server registered but not ready");
        }
        if let Err(e) = router.add_client(client).await {
            tracing::error!(server = %name, error = %e, "failed to register downstream client");
        }
    }

    for name in stack.agents.keys() {
        gateway.register_agent(name.clone(), stack.agents[name].clone()).await;
    }
    for (name, spec) in &stack.agents {
        if spec.a2a {
            a2a.register_local_agent(name).await;
        }
    }

    // A2A adapters registered last (spec.md §9): every remote an agent's
    // `uses` names becomes a downstream client presenting the peer's skills
    // as MCP tools.
    for (name, remote) in &stack.remotes {
        match gridctl::a2a::RemoteAgentAdapter::new(name.clone(), remote.endpoint.clone(), remote.auth.clone()) {
            Ok(adapter) => {
                let client = Arc::new(DownstreamClient::new(name.clone(), Arc::new(adapter), None));
                if let Err(e) = client.initialize(CancellationToken::new()).await {
                    tracing::warn!(remote = %name, error = %e, "remote A2A agent card fetch failed");
                }
                if let Err(e) = router.add_client(client).await {
                    tracing::error!(remote = %name, error = %e, "failed to register remote A2A adapter");
                }
            }
            Err(e) => tracing::error!(remote = %name, error = %e, "failed to build remote A2A adapter"),
        }
    }

    let agent_descriptions: HashMap<String, String> =
        stack.agents.iter().filter_map(|(name, spec)| spec.description.clone().map(|d| (name.clone(), d))).collect();

    let reload_engine = Arc::new(ReloadEngine::new(stack_path.clone(), stack, router.clone(), gateway.clone(), a2a.clone(), runtime));

    let bearer_token = std::env::var("GRIDCTL_TOKEN").ok();
    let state = AppState::new(
        gateway,
        a2a,
        reload_engine.clone(),
        logs,
        bearer_token,
        write_state_as.clone().unwrap_or_default(),
        agent_descriptions,
    );
    state.mark_ready();

    let shutdown = CancellationToken::new();
    let health_supervisor = HealthSupervisor::new(router.clone());
    let health_handle_guard = health_supervisor.spawn_all(shutdown.clone()).await;

    let watch_handle = if watch { Some(reload_engine.clone().watch(shutdown.clone())) } else { None };

    if let Some(stack_name) = write_state_as {
        let daemon_state = state.daemon_state(port, &stack_path.to_string_lossy()).await;
        if let Err(e) = daemon_state.write() {
            tracing::error!(error = %e, "failed to write daemon state file");
        }
        let _ = stack_name;
    }

    let addr = format!("127.0.0.1:{port}").parse().expect("127.0.0.1:<port> always parses");
    let app = gridctl_gateway::build_app(state);
    let result = gridctl_gateway::serve(addr, app).await;

    shutdown.cancel();
    for h in health_handle_guard {
        let _ = h.await;
    }
    if let Some(h) = watch_handle {
        h.abort();
    }
    router.close_all().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", style("error").red());
            ExitCode::from(1)
        }
    }
}

async fn destroy(stack_name: &str) -> ExitCode {
    let controller = match LifecycleController::new() {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    match controller.destroy(stack_name).await {
        Ok(()) => {
            println!("{} stack '{stack_name}' destroyed", style("success").green());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn status() -> ExitCode {
    let controller = match LifecycleController::new() {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    match controller.status() {
        Ok(entries) if entries.is_empty() => {
            println!("no stacks deployed");
            ExitCode::SUCCESS
        }
        Ok(entries) => {
            for entry in entries {
                let state = if entry.running { style("running").green() } else { style("stopped").red() };
                println!("{:<20} {state}  pid={:<8} port={}", entry.stack_name, entry.pid, entry.port);
            }
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

async fn reload(stack_name: &str) -> ExitCode {
    let controller = match LifecycleController::new() {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    match controller.reload(stack_name).await {
        Ok(report) if report.success => {
            println!(
                "{} added={:?} removed={:?} modified={:?}",
                style("reload ok").green(),
                report.added,
                report.removed,
                report.modified
            );
            ExitCode::SUCCESS
        }
        Ok(report) => {
            eprintln!("{}: {:?}", style("reload had errors").yellow(), report.errors);
            ExitCode::from(1)
        }
        Err(e) => fail(&e),
    }
}

/// `link`/`unlink` (spec.md §1: "LLM-client config-file editing" is an
/// out-of-scope collaborator touched only at this interface). Writes or
/// removes a single `mcpServers.<stack>` entry pointing at the running
/// daemon's `/mcp` endpoint, the shape Claude Desktop-style config files use.
fn link(stack_name: &str, client_config: &Path, add: bool) -> ExitCode {
    let existing = std::fs::read_to_string(client_config).unwrap_or_else(|_| "{}".to_string());
    let mut doc: serde_json::Value = match serde_json::from_str(&existing) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{}: malformed client config: {e}", style("error").red());
            return ExitCode::from(3);
        }
    };

    let servers = doc.as_object_mut().map(|o| o.entry("mcpServers").or_insert_with(|| serde_json::json!({})));
    let Some(servers) = servers.and_then(|v| v.as_object_mut()) else {
        eprintln!("{}: client config is not a JSON object", style("error").red());
        return ExitCode::from(3);
    };

    if add {
        let state = match DaemonState::read(stack_name) {
            Ok(Some(s)) => s,
            Ok(None) => {
                eprintln!("{}: stack '{stack_name}' is not deployed", style("error").red());
                return ExitCode::from(1);
            }
            Err(e) => return fail(&e),
        };
        servers.insert(stack_name.to_string(), serde_json::json!({ "url": format!("http://127.0.0.1:{}/mcp", state.port) }));
    } else {
        servers.remove(stack_name);
    }

    match serde_json::to_string_pretty(&doc).and_then(|s| Ok(std::fs::write(client_config, s))) {
        Ok(Ok(())) => {
            println!("{} {}", style(if add { "linked" } else { "unlinked" }).green(), client_config.display());
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("{}: failed to write client config", style("error").red());
            ExitCode::from(1)
        }
    }
}

fn fail(e: &GatewayError) -> ExitCode {
    eprintln!("{}: {e}", style("error").red());
    ExitCode::from(1)
}
