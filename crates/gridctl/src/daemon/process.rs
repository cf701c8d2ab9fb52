use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{GatewayError, Result};

/// `kill(pid, 0)` liveness check (spec.md §4.8): `ESRCH` means gone, anything
/// else (including a permission error) means something still answers to
/// that PID.
pub fn is_running(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

pub fn send_sigterm(pid: i32) -> Result<()> {
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| GatewayError::Fatal(format!("failed to send SIGTERM to pid {pid}: {e}")))
}

pub fn send_sigkill(pid: i32) -> Result<()> {
    signal::kill(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|e| GatewayError::Fatal(format!("failed to send SIGKILL to pid {pid}: {e}")))
}

/// Polls `is_running` until it reports false or `timeout` elapses; used by
/// `destroy` (spec.md §4.8: "sends SIGTERM to PID, waits ≤5 s, SIGKILL if
/// still alive").
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_running(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    !is_running(pid)
}

pub enum ForkOutcome {
    Parent { child_pid: i32 },
    Child,
}

/// Forks, detaches the child into a new session, and redirects its
/// stdout/stderr to `log_path` (spec.md §4.8: "forks a child ... detaches
/// (new session), redirects stdout/stderr to `<base>/logs/<name>.log`").
///
/// Must run before the tokio runtime starts — `fork` is only safe to call
/// from a single-threaded process, and the parent returns immediately
/// without touching any runtime state the child would otherwise have
/// inherited half-initialized.
///
/// # Safety
/// Caller must ensure no other threads are running (fork is not
/// async-signal-safe across a multi-threaded process).
pub unsafe fn fork_and_detach(log_path: &Path) -> Result<ForkOutcome> {
    match nix::unistd::fork().map_err(|e| GatewayError::Fatal(format!("fork failed: {e}")))? {
        nix::unistd::ForkResult::Parent { child } => Ok(ForkOutcome::Parent { child_pid: child.as_raw() }),
        nix::unistd::ForkResult::Child => {
            nix::unistd::setsid().map_err(|e| GatewayError::Fatal(format!("setsid failed: {e}")))?;

            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| GatewayError::Fatal(format!("failed to create log dir: {e}")))?;
            }
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(|e| GatewayError::Fatal(format!("failed to open daemon log '{}': {e}", log_path.display())))?;
            let fd = log_file.as_raw_fd();
            nix::unistd::dup2(fd, 1).map_err(|e| GatewayError::Fatal(format!("failed to redirect stdout: {e}")))?;
            nix::unistd::dup2(fd, 2).map_err(|e| GatewayError::Fatal(format!("failed to redirect stderr: {e}")))?;

            Ok(ForkOutcome::Child)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_reports_running() {
        assert!(is_running(std::process::id() as i32));
    }

    #[test]
    fn an_unused_high_pid_reports_not_running() {
        assert!(!is_running(999_999_999));
    }
}
