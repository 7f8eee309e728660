use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ProcessInspector, Signal};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default)]
struct FakeProcess {
    memory_mb: u64,
    ignores_terminate: bool,
    paused: bool,
}

#[derive(Debug)]
struct FakeState {
    processes: HashMap<u32, FakeProcess>,
    signals: Vec<(u32, Signal)>,
    load: Option<f64>,
    cpus: usize,
    disk_mb: u64,
}

/// In-memory process table for tests.
#[derive(Debug)]
pub struct FakeInspector {
    state: Mutex<FakeState>,
}

impl Default for FakeInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInspector {
    /// Idle 4-core host with no processes.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                processes: HashMap::new(),
                signals: Vec::new(),
                load: Some(0.0),
                cpus: 4,
                disk_mb: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spawn_process(&self, pid: u32, memory_mb: u64) {
        self.lock().processes.insert(
            pid,
            FakeProcess {
                memory_mb,
                ..FakeProcess::default()
            },
        );
    }

    /// Simulate the process exiting on its own.
    pub fn exit_process(&self, pid: u32) {
        self.lock().processes.remove(&pid);
    }

    pub fn set_memory(&self, pid: u32, memory_mb: u64) {
        if let Some(p) = self.lock().processes.get_mut(&pid) {
            p.memory_mb = memory_mb;
        }
    }

    /// Make SIGTERM a no-op for `pid`.
    pub fn ignore_terminate(&self, pid: u32) {
        if let Some(p) = self.lock().processes.get_mut(&pid) {
            p.ignores_terminate = true;
        }
    }

    pub fn set_load(&self, load: Option<f64>) {
        self.lock().load = load;
    }

    pub fn set_cpu_count(&self, cpus: usize) {
        self.lock().cpus = cpus;
    }

    pub fn set_disk_usage(&self, disk_mb: u64) {
        self.lock().disk_mb = disk_mb;
    }

    pub fn is_paused(&self, pid: u32) -> bool {
        self.lock().processes.get(&pid).is_some_and(|p| p.paused)
    }

    /// Signals delivered to `pid`, in order.
    pub fn signals_for(&self, pid: u32) -> Vec<Signal> {
        self.lock()
            .signals
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn signal_count(&self) -> usize {
        self.lock().signals.len()
    }
}

impl ProcessInspector for FakeInspector {
    fn is_alive(&self, pid: u32) -> bool {
        self.lock().processes.contains_key(&pid)
    }

    fn resident_memory_mb(&self, pid: u32) -> Option<u64> {
        self.lock().processes.get(&pid).map(|p| p.memory_mb)
    }

    fn load_average(&self) -> Option<f64> {
        self.lock().load
    }

    fn cpu_count(&self) -> usize {
        self.lock().cpus
    }

    fn disk_usage_mb(&self, _path: &Path) -> u64 {
        self.lock().disk_mb
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let mut state = self.lock();
        let Some(process) = state.processes.get_mut(&pid) else {
            return Err(EngineError::ProcessNotFound { pid });
        };
        let exits = match signal {
            Signal::Terminate => !process.ignores_terminate,
            Signal::Kill => true,
            Signal::Pause => {
                process.paused = true;
                false
            }
            Signal::Resume => {
                process.paused = false;
                false
            }
        };
        if exits {
            state.processes.remove(&pid);
        }
        state.signals.push((pid, signal));
        Ok(())
    }
}
