use std::fs::{File, OpenOptions};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::config::Paths;
use crate::error::{GatewayError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Advisory lock on `<name>.lock`, held for the lifetime of a deploy/destroy
/// flow (spec.md §4.8/§7: "acquired for ≤5 s; writers are the deploy and
/// destroy flows only"). Released when dropped.
pub struct StateLock {
    _file: File,
}

impl StateLock {
    /// Tries non-blocking locks in a poll loop up to `timeout`; returns
    /// `Conflict` if another process still holds it.
    pub fn acquire(stack_name: &str, timeout: Duration) -> Result<StateLock> {
        std::fs::create_dir_all(Paths::state_dir())
            .map_err(|e| GatewayError::Fatal(format!("failed to create state dir: {e}")))?;
        let path = Paths::lock_file(stack_name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| GatewayError::Fatal(format!("failed to open lock file '{}': {e}", path.display())))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(StateLock { _file: file }),
                Err(_) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Err(_) => {
                    return Err(GatewayError::Conflict(format!(
                        "stack '{stack_name}' is locked by another gridctl process"
                    )))
                }
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        fs2::FileExt::unlock(&self._file).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_conflicts_while_first_is_held() {
        let dir = tempdir().unwrap();
        std::env::set_var("GRIDCTL_PATH_ROOT", dir.path());
        let first = StateLock::acquire("demo", Duration::from_millis(50)).unwrap();
        let err = StateLock::acquire("demo", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        drop(first);
        let second = StateLock::acquire("demo", Duration::from_millis(50));
        assert!(second.is_ok());
        std::env::remove_var("GRIDCTL_PATH_ROOT");
    }
}
