use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::rpc::JsonRpcResponse;

/// Default idle reap period for SSE sessions (spec.md §4.4: "default 30 min").
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Bounded outbound queue depth; a slow/disconnected client backs up here
/// rather than unbounded in memory.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Open,
    Closing,
    Closed,
}

/// A northbound SSE session (spec.md §3): id, bounded outbound queue,
/// last-activity clock, lifecycle. A session id appears in at most one SSE
/// stream at a time — enforced by `SessionManager` only ever handing the
/// receiver half out once, on creation.
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    lifecycle: RwLock<SessionLifecycle>,
    outbound: mpsc::Sender<JsonRpcResponse>,
}

impl Session {
    /// Enqueues a response to be delivered on this session's SSE stream.
    /// Responses for one session are delivered in the order enqueued here
    /// (spec.md §5: "per session, JSON-RPC responses are delivered in the
    /// order the downstream replied").
    pub async fn send(&self, response: JsonRpcResponse) -> bool {
        *self.last_activity.lock().await = Utc::now();
        self.outbound.send(response).await.is_ok()
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Utc::now();
    }

    pub async fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let last = *self.last_activity.lock().await;
        (now - last).to_std().unwrap_or(Duration::ZERO)
    }

    pub async fn lifecycle(&self) -> SessionLifecycle {
        *self.lifecycle.read().await
    }

    pub async fn mark_closing(&self) {
        *self.lifecycle.write().await = SessionLifecycle::Closing;
    }
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Owns the id → session map. Sessions are created by the `GET /sse` handler
/// and destroyed when the stream closes or on idle reap (spec.md §4.4).
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager::default()
    }

    /// Creates a session and returns it along with the receiver half its SSE
    /// handler task drains. The 128-bit id is random, per spec.md §3.
    pub async fn create(&self) -> (Arc<Session>, mpsc::Receiver<JsonRpcResponse>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let session = Arc::new(Session {
            id: random_session_id(),
            created_at: Utc::now(),
            last_activity: Mutex::new(Utc::now()),
            lifecycle: RwLock::new(SessionLifecycle::Open),
            outbound: tx,
        });
        self.sessions.write().await.insert(session.id.clone(), session.clone());
        (session, rx)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Destroys a session: it is removed from the map, and since `Session`'s
    /// only held reference is this one plus whatever the SSE handler task has,
    /// dropping it closes the outbound channel — in-flight responses are
    /// dropped (spec.md §9 open question: conservative choice).
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Reaps sessions idle longer than `timeout`. Intended to run on a
    /// ticker alongside the health supervisor.
    pub async fn reap_idle(&self, timeout: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut reaped = Vec::new();
        let candidates: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in candidates {
            if session.idle_for(now).await >= timeout {
                reaped.push(session.id.clone());
            }
        }
        for id in &reaped {
            self.remove(id).await;
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_assigns_unique_hex_ids() {
        let manager = SessionManager::new();
        let (a, _rx_a) = manager.create().await;
        let (b, _rx_b) = manager.create().await;
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
    }

    #[tokio::test]
    async fn send_delivers_in_order() {
        let manager = SessionManager::new();
        let (session, mut rx) = manager.create().await;
        session.send(JsonRpcResponse::success(serde_json::json!(1), serde_json::json!("a"))).await;
        session.send(JsonRpcResponse::success(serde_json::json!(2), serde_json::json!("b"))).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.id, serde_json::json!(1));
        assert_eq!(second.id, serde_json::json!(2));
    }

    #[tokio::test]
    async fn remove_drops_outbound_so_handler_task_ends() {
        let manager = SessionManager::new();
        let (session, mut rx) = manager.create().await;
        manager.remove(&session.id).await;
        drop(session);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reap_idle_removes_sessions_past_timeout() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.create().await;
        *session.last_activity.lock().await = Utc::now() - chrono::Duration::hours(1);
        let reaped = manager.reap_idle(Duration::from_secs(60)).await;
        assert_eq!(reaped, vec![session.id.clone()]);
        assert!(manager.get(&session.id).await.is_none());
    }
}
