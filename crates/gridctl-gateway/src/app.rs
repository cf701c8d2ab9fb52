use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::a2a_routes::{handle_card, handle_directory, handle_rpc};
use crate::api_routes::{handle_health, handle_logs, handle_ready, handle_reload, handle_status, handle_tools};
use crate::auth::require_bearer;
use crate::mcp_routes::handle_mcp;
use crate::sse::{handle_message, handle_sse};
use crate::state::AppState;

/// Request timeout applied to every route (spec.md §5 names no explicit
/// bound; this guards against a downstream hang pinning a connection
/// indefinitely).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Assembles the full northbound surface: `/mcp`, `/sse` + `/message`,
/// `/.well-known/agent.json` + `/a2a/{agent}`, and the `/api/*` operator
/// surface (spec.md §4.4, §4.6, §6). Bearer auth wraps everything except
/// `/ready`/`/health`, enforced inside `require_bearer` itself.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/sse", get(handle_sse))
        .route("/message", post(handle_message))
        .route("/.well-known/agent.json", get(handle_directory))
        .route("/a2a/{agent}", get(handle_card).post(handle_rpc))
        .route("/api/status", get(handle_status))
        .route("/api/tools", get(handle_tools))
        .route("/api/logs", get(handle_logs))
        .route("/api/reload", post(handle_reload))
        .route("/ready", get(handle_ready))
        .route("/health", get(handle_health))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_bearer))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}

/// Binds and serves `app` on `addr`, returning once a graceful shutdown
/// signal has drained in-flight requests (spec.md §5).
pub async fn serve(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gridctl-gateway listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
