//! Bounded cleanup of agent leftovers.
//!
//! Every step runs under its own timeout and is independent of the others:
//! a hung `git worktree remove` does not keep the prompt files around or the
//! process alive.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::process::{self, ProcessInspector};
use crate::session::{AgentRecord, AgentStatus, ReconcileReport, SessionStore};
use crate::supervisor::{TMP_DIR, prompt_path};
use crate::workspace::WorkspaceBackend;

/// One unit of cleanup work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStep {
    KillProcess { pid: u32 },
    RemoveWorkspace { path: PathBuf },
    DeleteBranch { branch: String },
    RemoveTempFiles { paths: Vec<PathBuf> },
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KillProcess { pid } => write!(f, "kill process {pid}"),
            Self::RemoveWorkspace { path } => write!(f, "remove workspace {}", path.display()),
            Self::DeleteBranch { branch } => write!(f, "delete branch {branch}"),
            Self::RemoveTempFiles { paths } => write!(f, "remove {} temp file(s)", paths.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Timeout,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: CleanupStep,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub steps: Vec<StepReport>,
}

impl CleanupReport {
    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Success)
    }

    pub fn unsuccessful(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.status != StepStatus::Success)
    }

    fn merge(&mut self, other: Self) {
        self.steps.extend(other.steps);
    }
}

/// Result of [`CleanupManager::sweep`].
#[derive(Debug, Default)]
pub struct SweepReport {
    pub reconciled: ReconcileReport,
    /// Agents whose workspace was released.
    pub released: Vec<String>,
    /// Workspace directories no session record refers to.
    pub orphans: Vec<PathBuf>,
    pub cleanup: CleanupReport,
}

pub struct CleanupManager {
    sessions: Arc<SessionStore>,
    workspaces: Arc<dyn WorkspaceBackend>,
    inspector: Arc<dyn ProcessInspector>,
    state_dir: PathBuf,
    step_timeout: Duration,
}

impl CleanupManager {
    pub fn new(
        sessions: Arc<SessionStore>,
        workspaces: Arc<dyn WorkspaceBackend>,
        inspector: Arc<dyn ProcessInspector>,
        state_dir: impl Into<PathBuf>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            workspaces,
            inspector,
            state_dir: state_dir.into(),
            step_timeout,
        }
    }

    /// Run one step under the step timeout.
    pub async fn run_step(&self, step: CleanupStep) -> StepReport {
        let status = match tokio::time::timeout(self.step_timeout, self.execute(&step)).await {
            Ok(Ok(())) => {
                debug!(%step, "Cleanup step succeeded");
                StepStatus::Success
            }
            Ok(Err(e)) => {
                warn!(%step, error = %e, "Cleanup step failed");
                StepStatus::Failed(e.to_string())
            }
            Err(_) => {
                warn!(%step, timeout_secs = self.step_timeout.as_secs(), "Cleanup step timed out");
                StepStatus::Timeout
            }
        };
        StepReport { step, status }
    }

    /// Run `steps` in order; a failing step does not stop the rest.
    pub async fn run_steps(&self, steps: Vec<CleanupStep>) -> CleanupReport {
        let mut report = CleanupReport::default();
        for step in steps {
            report.steps.push(self.run_step(step).await);
        }
        report
    }

    /// Clean up after one failed operation.
    ///
    /// Kills the process if it still lives, releases the workspace, deletes
    /// the branch and the prompt file. A still-running record becomes
    /// `failed`.
    pub async fn cleanup_agent(&self, record: &AgentRecord) -> Result<CleanupReport> {
        let mut steps = Vec::new();
        if let Some(pid) = record.pid
            && record.is_running()
            && self.inspector.is_alive(pid)
        {
            steps.push(CleanupStep::KillProcess { pid });
        }

        let workspace = match self.sessions.claim_workspace_release(&record.id).await {
            Ok(path) => path,
            Err(EngineError::AgentNotFound { .. }) => record.pending_workspace().cloned(),
            Err(e) => return Err(e),
        };
        if let Some(path) = workspace {
            steps.push(CleanupStep::RemoveWorkspace { path });
        }
        if let Some(branch) = &record.branch {
            steps.push(CleanupStep::DeleteBranch {
                branch: branch.clone(),
            });
        }
        steps.push(CleanupStep::RemoveTempFiles {
            paths: vec![prompt_path(&self.state_dir, &record.id)],
        });

        let report = self.run_steps(steps).await;
        match self
            .sessions
            .finish_if_running(&record.id, AgentStatus::Failed)
            .await
        {
            Ok(_) | Err(EngineError::AgentNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(
            agent_id = %record.id,
            steps = report.steps.len(),
            ok = report.all_succeeded(),
            "Agent cleanup finished"
        );
        Ok(report)
    }

    /// Reconcile the session and remove everything finished agents left.
    ///
    /// Branches are kept: they hold the agents' work.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            reconciled: self.sessions.reconcile(self.inspector.as_ref()).await?,
            ..SweepReport::default()
        };
        let agents = self.sessions.agents().await?;

        let mut steps = Vec::new();
        for agent in agents.iter().filter(|a| !a.is_running()) {
            if let Some(path) = self.sessions.claim_workspace_release(&agent.id).await? {
                report.released.push(agent.id.clone());
                steps.push(CleanupStep::RemoveWorkspace { path });
            }
        }

        let referenced: HashSet<&Path> = agents
            .iter()
            .filter_map(|a| a.workspace_path.as_deref())
            .collect();
        // Archived while running, e.g. by `archive_and_clear`.
        let archived: Vec<AgentRecord> = self
            .sessions
            .archived_agents()
            .await?
            .into_iter()
            .filter(AgentRecord::is_running)
            .collect();
        for dir in self.workspaces.list_workspaces().await? {
            if referenced.contains(dir.as_path()) {
                continue;
            }
            let live_owner = archived
                .iter()
                .find(|a| a.workspace_path.as_deref() == Some(dir.as_path()) && self.owner_alive(a));
            if let Some(owner) = live_owner {
                warn!(path = %dir.display(), pid = ?owner.pid, "Untracked workspace has a live owner, keeping it");
            } else {
                info!(path = %dir.display(), "Removing orphan workspace");
                report.orphans.push(dir.clone());
                steps.push(CleanupStep::RemoveWorkspace { path: dir });
            }
        }

        let running: HashSet<&str> = agents
            .iter()
            .filter(|a| a.is_running())
            .map(|a| a.id.as_str())
            .collect();
        let stale = stale_temp_files(&self.state_dir.join(TMP_DIR), &running)?;
        if !stale.is_empty() {
            steps.push(CleanupStep::RemoveTempFiles { paths: stale });
        }

        report.cleanup.merge(self.run_steps(steps).await);
        info!(
            stopped = report.reconciled.stopped.len(),
            released = report.released.len(),
            orphans = report.orphans.len(),
            ok = report.cleanup.all_succeeded(),
            "Sweep finished"
        );
        Ok(report)
    }

    fn owner_alive(&self, agent: &AgentRecord) -> bool {
        agent.pid.is_some_and(|pid| self.inspector.is_alive(pid))
    }

    async fn execute(&self, step: &CleanupStep) -> Result<()> {
        match step {
            CleanupStep::KillProcess { pid } => {
                process::force_kill(self.inspector.as_ref(), *pid)?;
            }
            CleanupStep::RemoveWorkspace { path } => self.workspaces.remove_workspace(path).await?,
            CleanupStep::DeleteBranch { branch } => self.workspaces.delete_branch(branch).await?,
            CleanupStep::RemoveTempFiles { paths } => {
                for path in paths {
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Prompt files in `tmp_dir` not belonging to a running agent.
fn stale_temp_files(tmp_dir: &Path, running: &HashSet<&str>) -> Result<Vec<PathBuf>> {
    if !tmp_dir.exists() {
        return Ok(Vec::new());
    }
    let mut stale = Vec::new();
    for entry in std::fs::read_dir(tmp_dir)? {
        let path = entry?.path();
        let owner = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".prompt.md"));
        if owner.is_none_or(|id| !running.contains(id)) {
            stale.push(path);
        }
    }
    stale.sort();
    Ok(stale)
}
