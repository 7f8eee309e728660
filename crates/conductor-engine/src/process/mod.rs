//! Process introspection and signalling.
//!
//! Everything the engine needs to know about OS processes goes through
//! [`ProcessInspector`] so the scheduling and recovery logic can be tested
//! against [`FakeInspector`] without real workers.

mod system;
#[cfg(any(test, feature = "test-utils"))]
mod fake;

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeInspector;
pub use system::SystemInspector;

/// Interval between liveness checks while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signals the engine sends to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Graceful shutdown request (SIGTERM).
    Terminate,
    /// Forced kill (SIGKILL).
    Kill,
    /// Suspend (SIGSTOP).
    Pause,
    /// Resume a suspended process (SIGCONT).
    Resume,
}

/// Read-only process/host introspection plus signal delivery.
pub trait ProcessInspector: Send + Sync {
    /// Whether `pid` refers to a running (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Resident set size in MB, `None` if the process is gone.
    fn resident_memory_mb(&self, pid: u32) -> Option<u64>;

    /// One-minute load average.
    fn load_average(&self) -> Option<f64>;

    fn cpu_count(&self) -> usize;

    /// Total size of regular files below `path`, in MB.
    fn disk_usage_mb(&self, path: &Path) -> u64;

    /// Deliver `signal`. A missing process yields `ProcessNotFound`.
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was not running when checked.
    AlreadyGone,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate_gracefully(
    inspector: &dyn ProcessInspector,
    pid: u32,
    grace: Duration,
) -> Result<Termination> {
    if !inspector.is_alive(pid) {
        return Ok(Termination::AlreadyGone);
    }

    match inspector.signal(pid, Signal::Terminate) {
        Ok(()) => {}
        Err(EngineError::ProcessNotFound { .. }) => return Ok(Termination::AlreadyGone),
        Err(e) => return Err(e),
    }

    if wait_for_exit(inspector, pid, grace).await {
        debug!(pid, "Process exited after SIGTERM");
        return Ok(Termination::Terminated);
    }

    warn!(pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, sending SIGKILL");
    force_kill(inspector, pid)
}

/// SIGKILL without a grace period.
pub fn force_kill(inspector: &dyn ProcessInspector, pid: u32) -> Result<Termination> {
    match inspector.signal(pid, Signal::Kill) {
        Ok(()) => {
            info!(pid, "Process killed");
            Ok(Termination::Killed)
        }
        Err(EngineError::ProcessNotFound { .. }) => Ok(Termination::AlreadyGone),
        Err(e) => Err(e),
    }
}

/// Poll liveness until the process is gone or `timeout` elapses.
pub async fn wait_for_exit(inspector: &dyn ProcessInspector, pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !inspector.is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}
