use std::time::Duration;

use reqwest::Client;

use super::lock::StateLock;
use super::process;
use super::state::DaemonState;
use crate::error::{GatewayError, Result};
use crate::reload::ReloadReport;

pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
const DESTROY_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub stack_name: String,
    pub running: bool,
    pub pid: i32,
    pub port: u16,
}

/// Implements the `deploy|destroy|status|reload` flows of spec.md §4.8,
/// modulo the actual fork/detach and gateway construction — those belong to
/// the binary (`gridctl-cli`) since forking must happen before the tokio
/// runtime starts. This controller owns the state/lock file bookkeeping and
/// the HTTP calls to an already-running daemon.
pub struct LifecycleController {
    client: Client,
}

impl LifecycleController {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to build lifecycle client: {e}")))?;
        Ok(LifecycleController { client })
    }

    /// Scenario D (spec.md §8): a stale state file names a dead PID. Deletes
    /// it and returns `None`; a live PID is returned as `Some`.
    pub fn check_and_clean(&self, stack_name: &str) -> Result<Option<DaemonState>> {
        let Some(state) = DaemonState::read(stack_name)? else { return Ok(None) };
        if process::is_running(state.pid) {
            Ok(Some(state))
        } else {
            DaemonState::delete(stack_name)?;
            Ok(None)
        }
    }

    /// Acquires the advisory lock and runs `check_and_clean`; fails with
    /// `Conflict` naming the running PID/port if the stack is already up.
    /// The returned lock must be held until the state file is written.
    pub fn prepare_deploy(&self, stack_name: &str) -> Result<StateLock> {
        let lock = StateLock::acquire(stack_name, LOCK_TIMEOUT)?;
        if let Some(state) = self.check_and_clean(stack_name)? {
            return Err(GatewayError::Conflict(format!(
                "stack '{stack_name}' is already running (pid {}, port {})",
                state.pid, state.port
            )));
        }
        Ok(lock)
    }

    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        let states = DaemonState::list_all()?;
        Ok(states
            .into_iter()
            .map(|s| StatusEntry {
                running: process::is_running(s.pid),
                stack_name: s.stack_name,
                pid: s.pid,
                port: s.port,
            })
            .collect())
    }

    /// `destroy` (spec.md §4.8): SIGTERM, wait ≤5 s, SIGKILL if still alive,
    /// then delete the state file.
    pub async fn destroy(&self, stack_name: &str) -> Result<()> {
        let _lock = StateLock::acquire(stack_name, LOCK_TIMEOUT)?;
        let Some(state) = DaemonState::read(stack_name)? else {
            return Err(GatewayError::UnknownServer(stack_name.to_string()));
        };
        if process::is_running(state.pid) {
            process::send_sigterm(state.pid)?;
            let pid = state.pid;
            let exited = tokio::task::spawn_blocking(move || process::wait_for_exit(pid, DESTROY_GRACE))
                .await
                .map_err(|e| GatewayError::Fatal(format!("destroy wait task failed: {e}")))?;
            if !exited {
                process::send_sigkill(state.pid)?;
            }
        }
        DaemonState::delete(stack_name)
    }

    /// Polls `GET {base_url}/ready` until it returns 200 or `timeout`
    /// elapses (spec.md §4.8: "up to 60 s").
    pub async fn wait_ready(&self, base_url: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let url = format!("{}/ready", base_url.trim_end_matches('/'));
        loop {
            if let Ok(response) = self.client.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// `reload` CLI command: POSTs `/api/reload` to the running daemon
    /// (spec.md §4.8).
    pub async fn reload(&self, stack_name: &str) -> Result<ReloadReport> {
        let Some(state) = DaemonState::read(stack_name)? else {
            return Err(GatewayError::UnknownServer(stack_name.to_string()));
        };
        let url = format!("http://127.0.0.1:{}/api/reload", state.port);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("reload request failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("malformed reload response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn with_path_root<T>(f: impl FnOnce() -> T) -> T {
        let dir = tempdir().unwrap();
        std::env::set_var("GRIDCTL_PATH_ROOT", dir.path());
        let result = f();
        std::env::remove_var("GRIDCTL_PATH_ROOT");
        result
    }

    #[test]
    fn stale_state_file_is_cleaned_up() {
        with_path_root(|| {
            let state = DaemonState {
                stack_name: "demo".to_string(),
                stack_file: "/tmp/demo.yaml".to_string(),
                pid: 999_999_999,
                port: 8787,
                started_at: Utc::now(),
            };
            state.write().unwrap();

            let controller = LifecycleController::new().unwrap();
            let result = controller.check_and_clean("demo").unwrap();
            assert!(result.is_none());
            assert!(DaemonState::read("demo").unwrap().is_none());
        });
    }

    #[test]
    fn live_process_is_reported_as_running() {
        with_path_root(|| {
            let state = DaemonState {
                stack_name: "demo".to_string(),
                stack_file: "/tmp/demo.yaml".to_string(),
                pid: std::process::id() as i32,
                port: 8787,
                started_at: Utc::now(),
            };
            state.write().unwrap();

            let controller = LifecycleController::new().unwrap();
            let result = controller.check_and_clean("demo").unwrap();
            assert!(result.is_some());
        });
    }

    #[test]
    fn prepare_deploy_conflicts_on_already_running_stack() {
        with_path_root(|| {
            let state = DaemonState {
                stack_name: "demo".to_string(),
                stack_file: "/tmp/demo.yaml".to_string(),
                pid: std::process::id() as i32,
                port: 8787,
                started_at: Utc::now(),
            };
            state.write().unwrap();

            let controller = LifecycleController::new().unwrap();
            let err = controller.prepare_deploy("demo").unwrap_err();
            assert!(matches!(err, GatewayError::Conflict(_)));
        });
    }
}
