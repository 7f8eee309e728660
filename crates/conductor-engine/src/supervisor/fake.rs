use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::backend::{DirectOutcome, LaunchedWorker, WorkerBackend, WorkerRequest};
use crate::error::{EngineError, Result};
use crate::process::FakeInspector;

const FIRST_PID: u32 = 4000;
const WORKER_MEMORY_MB: u64 = 100;

#[derive(Debug)]
struct FakeState {
    fail_launch: bool,
    direct_success: bool,
    launches: Vec<WorkerRequest>,
    direct_runs: Vec<WorkerRequest>,
    exits: HashMap<u32, oneshot::Sender<Option<i32>>>,
}

/// Worker backend that registers fake processes in a [`FakeInspector`].
#[derive(Debug)]
pub struct FakeWorkerBackend {
    inspector: Arc<FakeInspector>,
    next_pid: AtomicU32,
    state: Mutex<FakeState>,
}

impl FakeWorkerBackend {
    pub fn new(inspector: Arc<FakeInspector>) -> Self {
        Self {
            inspector,
            next_pid: AtomicU32::new(FIRST_PID),
            state: Mutex::new(FakeState {
                fail_launch: false,
                direct_success: true,
                launches: Vec::new(),
                direct_runs: Vec::new(),
                exits: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_launch(&self, fail: bool) {
        self.lock().fail_launch = fail;
    }

    pub fn direct_success(&self, success: bool) {
        self.lock().direct_success = success;
    }

    pub fn launches(&self) -> Vec<WorkerRequest> {
        self.lock().launches.clone()
    }

    pub fn direct_runs(&self) -> Vec<WorkerRequest> {
        self.lock().direct_runs.clone()
    }

    /// Let worker `pid` exit with `code`.
    pub fn finish(&self, pid: u32, code: i32) {
        self.inspector.exit_process(pid);
        if let Some(tx) = self.lock().exits.remove(&pid) {
            let _ = tx.send(Some(code));
        }
    }
}

#[async_trait]
impl WorkerBackend for FakeWorkerBackend {
    async fn launch(&self, request: &WorkerRequest) -> Result<LaunchedWorker> {
        let mut state = self.lock();
        state.launches.push(request.clone());
        if state.fail_launch {
            return Err(EngineError::SpawnFailed {
                reason: "simulated launch failure".to_string(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.inspector.spawn_process(pid, WORKER_MEMORY_MB);
        let (tx, rx) = oneshot::channel();
        state.exits.insert(pid, tx);
        Ok(LaunchedWorker { pid, exit: Some(rx) })
    }

    async fn run_direct(&self, request: &WorkerRequest) -> Result<DirectOutcome> {
        let mut state = self.lock();
        state.direct_runs.push(request.clone());
        let success = state.direct_success;
        Ok(DirectOutcome {
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            output: String::new(),
        })
    }
}
