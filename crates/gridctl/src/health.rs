use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::downstream::Health;
use crate::router::Router;

/// Default health-probe interval (spec.md §4.5: "default 30 s").
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
/// Spread between each client's first ping, so a stack with many servers
/// doesn't probe them all in the same instant (spec.md §4.5: "staggered
/// start to avoid thundering").
const STAGGER_STEP: Duration = Duration::from_millis(250);

/// Periodically pings every registered downstream client on a fixed
/// interval. A transition to unhealthy never removes the client from the
/// router — it only updates the status the `/api/status` surfaces
/// (spec.md §4.5).
pub struct HealthSupervisor {
    router: Arc<Router>,
    interval: Duration,
}

impl HealthSupervisor {
    pub fn new(router: Arc<Router>) -> Self {
        HealthSupervisor { router, interval: DEFAULT_INTERVAL }
    }

    pub fn with_interval(router: Arc<Router>, interval: Duration) -> Self {
        HealthSupervisor { router, interval }
    }

    /// Spawns one ticking task per currently-registered client, each offset
    /// by `STAGGER_STEP * index` before its first probe. Clients added later
    /// via reload are picked up by the next call to `spawn_all` (the reload
    /// engine re-invokes this after applying a diff) — a simpler model than
    /// reacting to router mutations mid-flight, and sufficient since reload
    /// already serializes behind its own mutex (spec.md §4.7).
    pub async fn spawn_all(&self, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let names = self.router.client_names().await;
        let mut handles = Vec::with_capacity(names.len());
        for (index, name) in names.into_iter().enumerate() {
            let router = self.router.clone();
            let interval = self.interval;
            let shutdown = shutdown.clone();
            let stagger = STAGGER_STEP * index as u32;
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(stagger) => {}
                }
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // consume the immediate first tick
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = ticker.tick() => {
                            let Some(client) = router.client(&name).await else { return };
                            let health = client.ping(CancellationToken::new()).await;
                            log_transition(&name, &health);
                        }
                    }
                }
            }));
        }
        handles
    }
}

fn log_transition(name: &str, health: &Health) {
    if health.healthy {
        tracing::debug!(server = %name, "health check ok");
    } else {
        tracing::warn!(server = %name, error = ?health.error, "health check failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::DownstreamClient;
    use crate::tool::{CallResult, Tool};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyTransport {
        pings: AtomicUsize,
    }

    #[async_trait]
    impl crate::downstream::Transport for FlakyTransport {
        async fn initialize(&self, _ctx: CancellationToken) -> crate::error::Result<crate::rpc::ServerInfo> {
            Ok(crate::rpc::ServerInfo { name: "flaky".into(), version: "0.0.0".into() })
        }
        async fn list_tools(&self, _ctx: CancellationToken) -> crate::error::Result<Vec<Tool>> {
            Ok(vec![])
        }
        async fn call_tool(&self, _ctx: CancellationToken, _name: &str, _args: Value) -> crate::error::Result<CallResult> {
            Ok(CallResult::text(""))
        }
        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn ping(&self, _ctx: CancellationToken) -> crate::error::Result<()> {
            let n = self.pings.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(())
            } else {
                Err(crate::error::GatewayError::Transport("down".to_string()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_pings_on_interval_and_records_health() {
        let router = Arc::new(Router::new());
        let transport = Arc::new(FlakyTransport { pings: AtomicUsize::new(0) });
        let client = Arc::new(DownstreamClient::new("flaky", transport, None));
        client.initialize(CancellationToken::new()).await.unwrap();
        router.add_client(client.clone()).await.unwrap();

        let supervisor = HealthSupervisor::with_interval(router, Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let handles = supervisor.spawn_all(shutdown.clone()).await;

        tokio::time::advance(Duration::from_millis(15)).await;
        tokio::task::yield_now().await;
        assert!(client.health().await.healthy);

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(!client.health().await.healthy);

        shutdown.cancel();
        for h in handles {
            let _ = h.await;
        }
    }
}
