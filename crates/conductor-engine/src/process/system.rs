use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{Signal as NixSignal, kill};
use sysinfo::{CpuRefreshKind, Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, System};
use tracing::debug;

use super::{ProcessInspector, Signal};
use crate::error::{EngineError, Result};

/// Inspector backed by the local OS through `sysinfo`; signals go through `nix`.
#[derive(Debug)]
pub struct SystemInspector {
    system: Mutex<System>,
    cpus: usize,
}

impl SystemInspector {
    pub fn new() -> Self {
        let system = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
        let cpus = system.cpus().len().max(1);
        Self {
            system: Mutex::new(system),
            cpus,
        }
    }

    /// Refresh one process and read a value from it. `None` if it is gone.
    fn with_process<T>(&self, pid: u32, read: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(pid).map(read)
    }
}

impl Default for SystemInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SystemInspector {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || i32::try_from(pid).is_err() {
            return false;
        }
        self.with_process(pid, |p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    fn resident_memory_mb(&self, pid: u32) -> Option<u64> {
        self.with_process(pid, |p| p.memory() / (1024 * 1024))
    }

    fn load_average(&self) -> Option<f64> {
        let load = System::load_average();
        // Platforms without a load average report all zeros.
        (load.one > 0.0 || load.five > 0.0 || load.fifteen > 0.0).then_some(load.one)
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn disk_usage_mb(&self, path: &Path) -> u64 {
        dir_size_bytes(path) / (1024 * 1024)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        send_signal(pid, signal)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| EngineError::ProcessNotFound { pid })?;
    let signo = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
        Signal::Pause => NixSignal::SIGSTOP,
        Signal::Resume => NixSignal::SIGCONT,
    };
    match kill(nix::unistd::Pid::from_raw(raw), signo) {
        Ok(()) => {
            debug!(pid, ?signal, "Signal delivered");
            Ok(())
        }
        Err(Errno::ESRCH) => Err(EngineError::ProcessNotFound { pid }),
        Err(e) => Err(EngineError::Io(e.into())),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) -> Result<()> {
    Err(EngineError::ProcessNotFound { pid })
}

/// Recursive size of regular files, not following symlinks.
fn dir_size_bytes(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    if !meta.is_dir() {
        return 0;
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|entry| dir_size_bytes(&entry.path()))
        .sum()
}
