use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use gridctl::a2a::A2aSubsystem;
use gridctl::daemon::DaemonState;
use gridctl::reload::ReloadEngine;
use gridctl::Gateway;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One line of the structured gateway log (spec.md §6: "`{level, ts
/// (RFC3339Nano), msg, component?, trace_id?, attrs?}`, one JSON object per
/// line"), captured by `LogLayer` into `LogBuffer`'s bounded ring so
/// `/api/logs` has something to serve without a separate log-shipping
/// pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: String,
    pub ts: DateTime<Utc>,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

const LOG_BUFFER_CAPACITY: usize = 2000;

/// A bounded ring of the gateway's own recent log lines, independent of
/// whatever `tracing_subscriber::fmt` layer is also printing to stdout.
/// Uses a plain `std::sync::Mutex` because `LogLayer::on_event` runs inside
/// `tracing`'s synchronous dispatch path, where `.await` isn't available.
#[derive(Default)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(LogBuffer::default())
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().expect("log buffer mutex poisoned");
        if entries.len() >= LOG_BUFFER_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Returns at most `lines` most-recent entries, optionally filtered to a
    /// minimum level (spec.md §6: "`/api/logs` | GET | ... `lines`, `level`").
    pub fn tail(&self, lines: usize, level: Option<&str>) -> Vec<LogEntry> {
        let entries = self.entries.lock().expect("log buffer mutex poisoned");
        entries
            .iter()
            .rev()
            .filter(|e| level.map(|lvl| e.level.eq_ignore_ascii_case(lvl)).unwrap_or(true))
            .take(lines)
            .rev()
            .cloned()
            .collect()
    }
}

/// A `tracing_subscriber::Layer` that mirrors every event the gateway emits
/// into a `LogBuffer`, installed alongside the `fmt` layer in
/// `init_tracing` so `GET /api/logs` reflects the same stream a human reads
/// on stdout.
pub struct LogLayer {
    buffer: Arc<LogBuffer>,
}

impl LogLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        LogLayer { buffer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.buffer.push(LogEntry {
            level: metadata.level().to_string(),
            ts: Utc::now(),
            msg: visitor.message.unwrap_or_default(),
            component: Some(metadata.target().to_string()),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

/// Shared handle every axum handler extracts via `State<AppState>`. Owns the
/// core `Gateway`/`A2aSubsystem`/`ReloadEngine` plus the northbound-only
/// bookkeeping (log buffer, readiness flag, bearer token, agent
/// descriptions for A2A card synthesis).
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub a2a: Arc<A2aSubsystem>,
    pub reload: Arc<ReloadEngine>,
    pub logs: Arc<LogBuffer>,
    pub bearer_token: Option<String>,
    pub stack_name: String,
    pub started_at: DateTime<Utc>,
    pub agent_descriptions: Arc<HashMap<String, String>>,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        gateway: Arc<Gateway>,
        a2a: Arc<A2aSubsystem>,
        reload: Arc<ReloadEngine>,
        logs: Arc<LogBuffer>,
        bearer_token: Option<String>,
        stack_name: String,
        agent_descriptions: HashMap<String, String>,
    ) -> Self {
        AppState {
            gateway,
            a2a,
            reload,
            logs,
            bearer_token,
            stack_name,
            started_at: Utc::now(),
            agent_descriptions: Arc::new(agent_descriptions),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flipped once by startup after every configured downstream has
    /// completed (or terminally failed) its initial `Initialize` (spec.md
    /// §4.8: "`/ready` returns 200 only after every registered downstream
    /// client has completed `Initialize`").
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub async fn daemon_state(&self, port: u16, stack_file: &str) -> DaemonState {
        DaemonState {
            stack_name: self.stack_name.clone(),
            stack_file: stack_file.to_string(),
            pid: std::process::id() as i32,
            port,
            started_at: self.started_at,
        }
    }
}
