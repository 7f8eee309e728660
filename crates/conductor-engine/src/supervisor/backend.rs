//! Worker execution backends.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use conductor_core::config::WorkerConfig;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::orchestration::Role;

/// Bytes of captured output kept in a [`DirectOutcome`].
const OUTPUT_TAIL_BYTES: usize = 4096;

/// Everything a backend needs to run one worker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub role: Role,
    pub prompt: String,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub env: HashMap<String, String>,
}

/// A detached worker.
#[derive(Debug)]
pub struct LaunchedWorker {
    pub pid: u32,
    /// Resolves with the exit code once the worker ends, if the backend can
    /// observe it.
    pub exit: Option<oneshot::Receiver<Option<i32>>>,
}

/// Result of a synchronous direct execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Tail of combined stdout/stderr.
    pub output: String,
}

/// Capability for running workers.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start a detached worker; returns once the process exists.
    async fn launch(&self, request: &WorkerRequest) -> Result<LaunchedWorker>;

    /// Run the task to completion in the calling flow.
    async fn run_direct(&self, request: &WorkerRequest) -> Result<DirectOutcome>;
}

/// Runs an external command-line tool (by default `claude -p <prompt>`).
#[derive(Debug, Clone)]
pub struct CliWorkerBackend {
    config: WorkerConfig,
}

impl CliWorkerBackend {
    pub const fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn command(&self, program: &str, args: &[String], request: &WorkerRequest) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|a| substitute(a, request)))
            .current_dir(&request.workdir)
            .envs(&self.config.env)
            .envs(&request.env)
            .env("CONDUCTOR_ROLE", request.role.as_str())
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl WorkerBackend for CliWorkerBackend {
    async fn launch(&self, request: &WorkerRequest) -> Result<LaunchedWorker> {
        let log = open_log(&request.log_path)?;
        let stderr = log.try_clone()?;

        let mut cmd = self.command(&self.config.program, &self.config.args, request);
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(stderr));
        // Own process group: a Ctrl-C aimed at the orchestrator must not
        // take the workers down with it.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            program = %self.config.program,
            role = %request.role,
            workdir = %request.workdir.display(),
            log = %request.log_path.display(),
            "Launching detached worker"
        );
        let mut child = cmd.spawn().map_err(|e| EngineError::SpawnFailed {
            reason: format!("{}: {e}", self.config.program),
        })?;
        let pid = child.id().ok_or_else(|| EngineError::SpawnFailed {
            reason: "worker exited before its pid could be read".to_string(),
        })?;

        // Reap the child so it never lingers as a zombie.
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(pid, error = %e, "Failed to wait for worker");
                    None
                }
            };
            debug!(pid, ?code, "Worker exited");
            let _ = tx.send(code);
        });

        Ok(LaunchedWorker {
            pid,
            exit: Some(rx),
        })
    }

    async fn run_direct(&self, request: &WorkerRequest) -> Result<DirectOutcome> {
        let program = self
            .config
            .direct_program
            .as_deref()
            .unwrap_or(&self.config.program);
        let args = self
            .config
            .direct_args
            .as_deref()
            .unwrap_or(&self.config.args);

        info!(program, role = %request.role, workdir = %request.workdir.display(), "Executing task directly");
        let output = self
            .command(program, args, request)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::SpawnFailed {
                reason: format!("{program}: {e}"),
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        match open_log(&request.log_path) {
            Ok(mut log) => {
                if let Err(e) = log.write_all(&combined) {
                    warn!(log = %request.log_path.display(), error = %e, "Failed to write worker log");
                }
            }
            Err(e) => warn!(log = %request.log_path.display(), error = %e, "Failed to open worker log"),
        }

        Ok(DirectOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: tail(&String::from_utf8_lossy(&combined), OUTPUT_TAIL_BYTES),
        })
    }
}

fn substitute(arg: &str, request: &WorkerRequest) -> String {
    arg.replace("{prompt}", &request.prompt)
        .replace("{workdir}", &request.workdir.to_string_lossy())
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Last `max` bytes of `s`, cut on a char boundary.
pub(crate) fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
