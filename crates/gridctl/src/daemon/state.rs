use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Paths;
use crate::error::{GatewayError, Result};

/// `<base>/state/<name>.json` (spec.md §3/§4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonState {
    pub stack_name: String,
    pub stack_file: String,
    pub pid: i32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

impl DaemonState {
    pub fn write(&self) -> Result<()> {
        std::fs::create_dir_all(Paths::state_dir())
            .map_err(|e| GatewayError::Fatal(format!("failed to create state dir: {e}")))?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GatewayError::Fatal(format!("failed to serialize daemon state: {e}")))?;
        std::fs::write(Paths::state_file(&self.stack_name), json)
            .map_err(|e| GatewayError::Fatal(format!("failed to write state file: {e}")))
    }

    pub fn read(stack_name: &str) -> Result<Option<DaemonState>> {
        let path = Paths::state_file(stack_name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| GatewayError::Fatal(format!("corrupt state file '{}': {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::Fatal(format!("failed to read state file '{}': {e}", path.display()))),
        }
    }

    pub fn delete(stack_name: &str) -> Result<()> {
        match std::fs::remove_file(Paths::state_file(stack_name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Fatal(format!("failed to delete state file: {e}"))),
        }
    }

    /// Lists every `<name>.json` in the state directory, stack name first.
    pub fn list_all() -> Result<Vec<DaemonState>> {
        let dir = Paths::state_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GatewayError::Fatal(format!("failed to list state dir: {e}"))),
        };
        let mut states = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GatewayError::Fatal(format!("failed to read state dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if let Some(state) = DaemonState::read(name)? {
                states.push(state);
            }
        }
        states.sort_by(|a, b| a.stack_name.cmp(&b.stack_name));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn with_path_root<T>(f: impl FnOnce() -> T) -> T {
        let dir = tempdir().unwrap();
        std::env::set_var("GRIDCTL_PATH_ROOT", dir.path());
        let result = f();
        std::env::remove_var("GRIDCTL_PATH_ROOT");
        result
    }

    #[test]
    fn round_trips_through_disk() {
        with_path_root(|| {
            let state = DaemonState {
                stack_name: "demo".to_string(),
                stack_file: "/tmp/demo.yaml".to_string(),
                pid: 4242,
                port: 8787,
                started_at: Utc::now(),
            };
            state.write().unwrap();
            let read_back = DaemonState::read("demo").unwrap().unwrap();
            assert_eq!(read_back, state);
            DaemonState::delete("demo").unwrap();
            assert!(DaemonState::read("demo").unwrap().is_none());
        });
    }

    #[test]
    fn missing_state_file_reads_as_none() {
        with_path_root(|| {
            assert!(DaemonState::read("ghost").unwrap().is_none());
        });
    }
}
