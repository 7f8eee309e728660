//! Worker supervision: admission, workspace isolation, launch and the
//! direct-execution fallback.
//!
//! A spawn goes admission check, workspace, prompt, detached launch, session
//! record. When the launch itself fails the task runs synchronously in the
//! same workspace instead, so a broken worker binary degrades throughput but
//! not correctness.

mod backend;
#[cfg(any(test, feature = "test-utils"))]
mod fake;
mod prompt;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub use backend::{CliWorkerBackend, DirectOutcome, LaunchedWorker, WorkerBackend, WorkerRequest};
#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeWorkerBackend;
pub use prompt::build_prompt;

use crate::error::{EngineError, Result};
use crate::orchestration::{ProjectContext, Role, Subtask, SubtaskLauncher};
use crate::process::{self, ProcessInspector, Signal, Termination};
use crate::resources::ResourceGovernor;
use crate::session::{AgentRecord, AgentStatus, SessionStore};
use crate::workspace::{Workspace, WorkspaceBackend};

/// Worker logs live in `<state>/logs`.
pub const LOGS_DIR: &str = "logs";
/// Prompt files live in `<state>/tmp`.
pub const TMP_DIR: &str = "tmp";

/// Path of the prompt file for agent `agent_id`.
pub fn prompt_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join(TMP_DIR).join(format!("{agent_id}.prompt.md"))
}

/// Result of one spawn attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// A detached worker is running.
    Spawned(AgentRecord),
    /// The launch failed and the task ran synchronously instead.
    ExecutedDirectly { record: AgentRecord, success: bool },
    /// Admission control said no; nothing was created.
    Denied { reasons: Vec<String> },
    Failed { reason: String },
}

impl SpawnOutcome {
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Spawned(_) | Self::ExecutedDirectly { success: true, .. }
        )
    }

    pub fn failure_reason(&self) -> String {
        match self {
            Self::Spawned(_) | Self::ExecutedDirectly { success: true, .. } => String::new(),
            Self::ExecutedDirectly { record, .. } => {
                format!("direct execution of agent {} failed", record.id)
            }
            Self::Denied { reasons } => EngineError::AdmissionDenied {
                reasons: reasons.clone(),
            }
            .to_string(),
            Self::Failed { reason } => reason.clone(),
        }
    }

    pub const fn record(&self) -> Option<&AgentRecord> {
        match self {
            Self::Spawned(record) | Self::ExecutedDirectly { record, .. } => Some(record),
            Self::Denied { .. } | Self::Failed { .. } => None,
        }
    }
}

/// Workspace key: role, UTC timestamp and a short random suffix.
fn workspace_key(role: Role) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{role}-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        &suffix[..8]
    )
}

/// Spawns, stops and restarts workers.
pub struct WorkerSupervisor {
    governor: Arc<ResourceGovernor>,
    sessions: Arc<SessionStore>,
    workspaces: Arc<dyn WorkspaceBackend>,
    worker: Arc<dyn WorkerBackend>,
    inspector: Arc<dyn ProcessInspector>,
    project: ProjectContext,
    state_dir: PathBuf,
    grace_period: Duration,
    /// Subtask behind each agent, for restarts.
    subtasks: RwLock<HashMap<String, Subtask>>,
}

impl WorkerSupervisor {
    pub fn new(
        governor: Arc<ResourceGovernor>,
        sessions: Arc<SessionStore>,
        workspaces: Arc<dyn WorkspaceBackend>,
        worker: Arc<dyn WorkerBackend>,
        inspector: Arc<dyn ProcessInspector>,
        project: ProjectContext,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            governor,
            sessions,
            workspaces,
            worker,
            inspector,
            project,
            state_dir: state_dir.into(),
            grace_period: Duration::from_secs(5),
            subtasks: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub const fn project(&self) -> &ProjectContext {
        &self.project
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Admission-checked spawn of one subtask.
    pub async fn spawn(&self, subtask: &Subtask) -> SpawnOutcome {
        let permit = match self.governor.try_admit().await {
            Ok(Ok(permit)) => permit,
            Ok(Err(decision)) => {
                info!(subtask = %subtask.id, reasons = ?decision.reasons, "Spawn denied by resource governor");
                return SpawnOutcome::Denied {
                    reasons: decision.reasons,
                };
            }
            Err(e) => {
                error!(subtask = %subtask.id, error = %e, "Admission check failed");
                return SpawnOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let key = workspace_key(subtask.role);
        let workspace = match self.workspaces.create_workspace(&key).await {
            Ok(workspace) => workspace,
            Err(e) => {
                let err = EngineError::WorkspaceCreationFailed {
                    reason: e.to_string(),
                };
                error!(subtask = %subtask.id, key, error = %err, "Cannot spawn without a workspace");
                return SpawnOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let (request, mut record) = self.prepare(subtask, &key, Some(&workspace)).await;
        match self.worker.launch(&request).await {
            Ok(launched) => {
                record.pid = Some(launched.pid);
                if let Err(e) = self.sessions.add_agent(record.clone()).await {
                    error!(agent_id = %record.id, pid = launched.pid, error = %e, "Failed to register agent, killing worker");
                    if let Err(kill_err) = process::force_kill(self.inspector.as_ref(), launched.pid) {
                        warn!(pid = launched.pid, error = %kill_err, "Failed to kill unregistered worker");
                    }
                    self.discard_workspace(&workspace).await;
                    return SpawnOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
                drop(permit);

                self.subtasks
                    .write()
                    .await
                    .insert(record.id.clone(), subtask.clone());
                if let Some(exit) = launched.exit {
                    self.watch_exit(record.id.clone(), launched.pid, exit);
                }
                info!(
                    agent_id = %record.id,
                    pid = launched.pid,
                    role = %record.role,
                    subtask = %subtask.id,
                    workspace = %workspace.path.display(),
                    "Agent spawned"
                );
                SpawnOutcome::Spawned(record)
            }
            Err(e) => {
                warn!(subtask = %subtask.id, error = %e, "Worker launch failed, executing directly");
                drop(permit);
                self.execute_directly(subtask, &request, record).await
            }
        }
    }

    /// Run `subtask` synchronously, without admission control.
    ///
    /// Uses a fresh workspace when one can be created, the project root
    /// otherwise.
    pub async fn run_direct(&self, subtask: &Subtask) -> SpawnOutcome {
        let key = workspace_key(subtask.role);
        let workspace = match self.workspaces.create_workspace(&key).await {
            Ok(workspace) => Some(workspace),
            Err(e) => {
                warn!(subtask = %subtask.id, error = %e, "No workspace for direct execution, using project root");
                None
            }
        };
        let (request, record) = self.prepare(subtask, &key, workspace.as_ref()).await;
        self.execute_directly(subtask, &request, record).await
    }

    /// Ask a worker to exit (SIGTERM) and mark it `stopped`.
    ///
    /// A process that is already gone counts as stopped.
    pub async fn stop(&self, pid: u32) -> Result<()> {
        match self.inspector.signal(pid, Signal::Terminate) {
            Ok(()) => info!(pid, "Sent SIGTERM to worker"),
            Err(EngineError::ProcessNotFound { .. }) => debug!(pid, "Worker already gone"),
            Err(e) => return Err(e),
        }
        match self.sessions.update_status(pid, AgentStatus::Stopped, None).await {
            Ok(record) => info!(agent_id = %record.id, pid, "Agent stopped"),
            Err(EngineError::AgentNotFound { .. }) => warn!(pid, "No session record for stopped pid"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Suspend a worker (SIGSTOP). Paused agents are exempt from the stuck
    /// check until [`resume`](Self::resume).
    pub async fn pause(&self, record: &AgentRecord) -> Result<()> {
        let pid = record.pid.ok_or_else(|| EngineError::AgentNotFound {
            id: record.id.clone(),
        })?;
        self.inspector.signal(pid, Signal::Pause)?;
        self.sessions.set_paused(&record.id, true).await?;
        info!(agent_id = %record.id, pid, "Agent paused");
        Ok(())
    }

    /// Continue a paused worker (SIGCONT).
    pub async fn resume(&self, pid: u32) -> Result<AgentRecord> {
        let record = self
            .sessions
            .load()
            .await?
            .agent_by_pid(pid)
            .filter(|a| a.is_running())
            .cloned()
            .ok_or_else(|| EngineError::AgentNotFound {
                id: format!("pid {pid}"),
            })?;
        self.inspector.signal(pid, Signal::Resume)?;
        let record = self.sessions.set_paused(&record.id, false).await?;
        info!(agent_id = %record.id, pid, "Agent resumed");
        Ok(record)
    }

    /// Resume every paused running agent. Returns the resumed records.
    pub async fn resume_all(&self) -> Result<Vec<AgentRecord>> {
        let mut resumed = Vec::new();
        for agent in self.sessions.running_agents().await? {
            let Some(pid) = agent.pid.filter(|_| agent.paused) else {
                continue;
            };
            match self.resume(pid).await {
                Ok(record) => resumed.push(record),
                Err(EngineError::ProcessNotFound { .. }) => {
                    debug!(agent_id = %agent.id, pid, "Paused agent already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resumed)
    }

    /// Terminate an agent and launch its subtask again.
    ///
    /// `note` is appended to the coordination note of the resubmitted task.
    pub async fn restart(&self, record: &AgentRecord, note: Option<&str>) -> Result<SpawnOutcome> {
        if let Some(pid) = record.pid {
            let how = process::terminate_gracefully(self.inspector.as_ref(), pid, self.grace_period).await?;
            debug!(agent_id = %record.id, pid, ?how, "Agent terminated for restart");
        }
        self.sessions
            .update_status_by_id(&record.id, AgentStatus::Stopped)
            .await?;
        self.release_workspace(record).await?;

        let mut subtask = self.subtask_for(record).await;
        if let Some(note) = note {
            let ctx = &mut subtask.context;
            if ctx.coordination_note.is_empty() {
                ctx.coordination_note = note.to_string();
            } else {
                ctx.coordination_note = format!("{} {note}", ctx.coordination_note);
            }
        }
        info!(agent_id = %record.id, subtask = %subtask.id, "Restarting agent");
        Ok(self.spawn(&subtask).await)
    }

    /// SIGKILL an agent, mark it `failed` and release its workspace.
    pub async fn kill(&self, record: &AgentRecord) -> Result<Termination> {
        let how = match record.pid {
            Some(pid) => process::force_kill(self.inspector.as_ref(), pid)?,
            None => Termination::AlreadyGone,
        };
        self.sessions
            .update_status_by_id(&record.id, AgentStatus::Failed)
            .await?;
        self.release_workspace(record).await?;
        info!(agent_id = %record.id, pid = ?record.pid, ?how, "Agent killed");
        Ok(how)
    }

    /// Remove the agent's workspace unless someone already did.
    ///
    /// Returns whether this call released it. The branch is kept.
    pub async fn release_workspace(&self, record: &AgentRecord) -> Result<bool> {
        let Some(path) = self.sessions.claim_workspace_release(&record.id).await? else {
            return Ok(false);
        };
        self.workspaces.remove_workspace(&path).await?;
        info!(agent_id = %record.id, workspace = %path.display(), "Workspace released");
        Ok(true)
    }

    async fn subtask_for(&self, record: &AgentRecord) -> Subtask {
        if let Some(subtask) = self.subtasks.read().await.get(&record.id) {
            return subtask.clone();
        }
        let id = record
            .subtask_id
            .clone()
            .unwrap_or_else(|| record.role.as_str().to_string());
        Subtask::new(id, record.role, record.task.clone())
    }

    /// Build the worker request and an unregistered record.
    async fn prepare(
        &self,
        subtask: &Subtask,
        key: &str,
        workspace: Option<&Workspace>,
    ) -> (WorkerRequest, AgentRecord) {
        let workdir = workspace.map_or_else(|| self.project.root.clone(), |w| w.path.clone());
        let log_path = self.state_dir.join(LOGS_DIR).join(format!("{key}.log"));

        let mut record = AgentRecord::new(subtask.role, subtask.description.clone());
        record.subtask_id = Some(subtask.id.clone());
        record.workspace_path = workspace.map(|w| w.path.clone());
        record.branch = workspace.and_then(|w| w.branch.clone());
        record.log_path = Some(log_path.clone());

        let prompt = build_prompt(subtask, &workdir, &self.project);
        let prompt_file = prompt_path(&self.state_dir, &record.id);
        if let Err(e) = prompt::write_prompt_file(&prompt_file, &prompt).await {
            warn!(agent_id = %record.id, error = %e, "Failed to write prompt file");
        }

        let env = HashMap::from([
            ("CONDUCTOR_AGENT_ID".to_string(), record.id.clone()),
            ("CONDUCTOR_SUBTASK_ID".to_string(), subtask.id.clone()),
        ]);
        let request = WorkerRequest {
            role: subtask.role,
            prompt,
            workdir,
            log_path,
            env,
        };
        (request, record)
    }

    async fn execute_directly(
        &self,
        subtask: &Subtask,
        request: &WorkerRequest,
        mut record: AgentRecord,
    ) -> SpawnOutcome {
        record.pid = None;
        record.executed_directly = true;

        let success = match self.worker.run_direct(request).await {
            Ok(outcome) => {
                if !outcome.success {
                    warn!(subtask = %subtask.id, exit_code = ?outcome.exit_code, output = %outcome.output, "Direct execution failed");
                }
                outcome.success
            }
            Err(e) => {
                error!(subtask = %subtask.id, error = %e, "Direct execution could not start");
                false
            }
        };
        let status = if success {
            AgentStatus::Completed
        } else {
            AgentStatus::Failed
        };
        record.finish(status, Utc::now());

        if let Err(e) = self.sessions.add_agent(record.clone()).await {
            error!(agent_id = %record.id, error = %e, "Failed to register direct execution");
        } else if !success
            && let Err(e) = self.release_workspace(&record).await
        {
            warn!(agent_id = %record.id, error = %e, "Failed to release workspace after failed direct run");
        }
        info!(agent_id = %record.id, subtask = %subtask.id, %status, "Direct execution finished");
        SpawnOutcome::ExecutedDirectly { record, success }
    }

    async fn discard_workspace(&self, workspace: &Workspace) {
        if let Err(e) = self.workspaces.remove_workspace(&workspace.path).await {
            warn!(workspace = %workspace.path.display(), error = %e, "Failed to remove workspace");
        }
    }

    /// Move the record to `completed`/`failed` when the worker exits on its own.
    fn watch_exit(
        &self,
        agent_id: String,
        pid: u32,
        exit: tokio::sync::oneshot::Receiver<Option<i32>>,
    ) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let Ok(code) = exit.await else {
                return;
            };
            let status = if code == Some(0) {
                AgentStatus::Completed
            } else {
                AgentStatus::Failed
            };
            match sessions.finish_if_running(&agent_id, status).await {
                Ok(true) => info!(agent_id = %agent_id, pid, ?code, %status, "Worker exited"),
                Ok(false) => debug!(agent_id = %agent_id, pid, ?code, "Worker exited after status change"),
                Err(e) => warn!(agent_id = %agent_id, pid, error = %e, "Failed to record worker exit"),
            }
        });
    }
}

#[async_trait]
impl SubtaskLauncher for WorkerSupervisor {
    async fn spawn(&self, subtask: &Subtask) -> SpawnOutcome {
        Self::spawn(self, subtask).await
    }

    async fn run_direct(&self, subtask: &Subtask) -> SpawnOutcome {
        Self::run_direct(self, subtask).await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::process::FakeInspector;
    use crate::workspace::FakeWorkspaceBackend;
    use conductor_core::config::LimitsConfig;

    struct Harness {
        _dir: tempfile::TempDir,
        state_dir: PathBuf,
        inspector: Arc<FakeInspector>,
        sessions: Arc<SessionStore>,
        workspaces: Arc<FakeWorkspaceBackend>,
        worker: Arc<FakeWorkerBackend>,
        supervisor: Arc<WorkerSupervisor>,
    }

    fn harness(limits: LimitsConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".conductor");
        let inspector = Arc::new(FakeInspector::new());
        let sessions = Arc::new(SessionStore::new(&state_dir));
        let workspaces = Arc::new(FakeWorkspaceBackend::new(state_dir.join("workspaces")));
        let worker = Arc::new(FakeWorkerBackend::new(Arc::clone(&inspector)));
        let governor = Arc::new(ResourceGovernor::new(
            limits,
            Arc::clone(&sessions),
            inspector.clone(),
            state_dir.join("workspaces"),
        ));
        let supervisor = Arc::new(
            WorkerSupervisor::new(
                governor,
                Arc::clone(&sessions),
                workspaces.clone(),
                worker.clone(),
                inspector.clone(),
                ProjectContext::new("generic", dir.path()),
                &state_dir,
            )
            .with_grace_period(Duration::from_millis(300)),
        );
        Harness {
            _dir: dir,
            state_dir,
            inspector,
            sessions,
            workspaces,
            worker,
            supervisor,
        }
    }

    fn backend_task() -> Subtask {
        Subtask::new("backend", Role::Backend, "Implement the login API")
    }

    #[test]
    fn workspace_key_starts_with_role() {
        let key = workspace_key(Role::Frontend);
        let parts: Vec<&str> = key.split('-').collect();
        assert_eq!(parts[0], "frontend");
        assert_eq!(parts[1].len(), "20261017T101010".len());
        assert_eq!(parts[2].len(), 8);
        assert_ne!(key, workspace_key(Role::Frontend));
    }

    #[test]
    fn outcome_success_and_reasons() {
        let record = AgentRecord::new(Role::Qa, "t");
        assert!(SpawnOutcome::Spawned(record.clone()).is_success());
        assert!(
            !SpawnOutcome::ExecutedDirectly {
                record,
                success: false
            }
            .is_success()
        );
        let denied = SpawnOutcome::Denied {
            reasons: vec!["a".into(), "b".into()],
        };
        assert_eq!(denied.failure_reason(), "Admission denied: a; b");
        assert!(denied.record().is_none());
    }

    #[tokio::test]
    async fn spawn_registers_running_agent() {
        let h = harness(LimitsConfig::default());

        let outcome = h.supervisor.spawn(&backend_task()).await;

        let SpawnOutcome::Spawned(record) = outcome else {
            panic!("expected Spawned, got {outcome:?}");
        };
        assert_eq!(record.status, AgentStatus::Running);
        assert_eq!(record.subtask_id.as_deref(), Some("backend"));
        let pid = record.pid.unwrap();
        assert!(h.inspector.is_alive(pid));

        let workspace = record.workspace_path.clone().unwrap();
        assert!(workspace.exists());
        assert!(
            workspace
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("backend-")
        );
        let log = record.log_path.clone().unwrap();
        assert!(log.starts_with(h.state_dir.join(LOGS_DIR)));

        let launch = &h.worker.launches()[0];
        assert_eq!(launch.workdir, workspace);
        assert!(launch.prompt.contains("Implement the login API"));
        assert!(prompt_path(&h.state_dir, &record.id).exists());

        let stored = h.sessions.agents().await.unwrap();
        assert_eq!(stored, vec![record]);
    }

    #[tokio::test]
    async fn denied_spawn_has_no_side_effects() {
        let h = harness(LimitsConfig {
            max_agents: 0,
            ..LimitsConfig::default()
        });

        let outcome = h.supervisor.spawn(&backend_task()).await;

        assert!(matches!(outcome, SpawnOutcome::Denied { ref reasons } if !reasons.is_empty()));
        assert!(h.workspaces.created().is_empty());
        assert!(h.worker.launches().is_empty());
        assert!(h.sessions.agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn workspace_failure_fails_without_launch() {
        let h = harness(LimitsConfig::default());
        h.workspaces.fail_create(true);

        let outcome = h.supervisor.spawn(&backend_task()).await;

        match outcome {
            SpawnOutcome::Failed { reason } => assert!(reason.starts_with("Workspace creation failed")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(h.worker.launches().is_empty());
    }

    #[tokio::test]
    async fn launch_failure_executes_directly() {
        let h = harness(LimitsConfig::default());
        h.worker.fail_launch(true);

        let outcome = h.supervisor.spawn(&backend_task()).await;

        let SpawnOutcome::ExecutedDirectly { record, success } = outcome else {
            panic!("expected ExecutedDirectly, got {outcome:?}");
        };
        assert!(success);
        assert!(record.executed_directly);
        assert_eq!(record.pid, None);
        assert_eq!(record.status, AgentStatus::Completed);
        assert!(record.completion_time.is_some());
        assert_eq!(h.worker.direct_runs()[0].workdir, record.workspace_path.clone().unwrap());
        assert_eq!(h.sessions.agents().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn failed_direct_execution_releases_workspace() {
        let h = harness(LimitsConfig::default());
        h.worker.fail_launch(true);
        h.worker.direct_success(false);

        let outcome = h.supervisor.spawn(&backend_task()).await;

        assert!(!outcome.is_success());
        let record = outcome.record().unwrap();
        assert_eq!(record.status, AgentStatus::Failed);
        assert_eq!(h.workspaces.removed(), vec![record.workspace_path.clone().unwrap()]);
        let stored = h.sessions.agents().await.unwrap();
        assert!(stored[0].workspace_released);
    }

    #[tokio::test]
    async fn direct_run_without_workspace_uses_project_root() {
        let h = harness(LimitsConfig::default());
        h.workspaces.fail_create(true);

        let outcome = h.supervisor.run_direct(&backend_task()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.record().unwrap().workspace_path, None);
        assert_eq!(h.worker.direct_runs()[0].workdir, h.supervisor.project().root);
    }

    #[tokio::test]
    async fn worker_exit_updates_status() {
        let h = harness(LimitsConfig::default());
        let ok = h.supervisor.spawn(&backend_task()).await;
        let bad = h.supervisor.spawn(&Subtask::new("qa", Role::Qa, "Test it")).await;
        let ok = ok.record().unwrap().clone();
        let bad = bad.record().unwrap().clone();

        h.worker.finish(ok.pid.unwrap(), 0);
        h.worker.finish(bad.pid.unwrap(), 2);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let agents = h.sessions.agents().await.unwrap();
            if agents.iter().all(|a| !a.is_running()) {
                let status = |id: &str| agents.iter().find(|a| a.id == id).unwrap().status;
                assert_eq!(status(&ok.id), AgentStatus::Completed);
                assert_eq!(status(&bad.id), AgentStatus::Failed);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "exit watcher never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn stop_marks_stopped_and_tolerates_missing_process() {
        let h = harness(LimitsConfig::default());
        let record = h.supervisor.spawn(&backend_task()).await.record().unwrap().clone();
        let pid = record.pid.unwrap();

        h.supervisor.stop(pid).await.unwrap();
        assert!(!h.inspector.is_alive(pid));
        assert_eq!(h.inspector.signals_for(pid), vec![Signal::Terminate]);
        assert_eq!(
            h.sessions.agents().await.unwrap()[0].status,
            AgentStatus::Stopped
        );

        // Already gone is still success.
        h.supervisor.stop(pid).await.unwrap();
    }

    #[tokio::test]
    async fn restart_releases_workspace_and_respawns_same_subtask() {
        let h = harness(LimitsConfig::default());
        let first = h.supervisor.spawn(&backend_task()).await.record().unwrap().clone();

        let outcome = h
            .supervisor
            .restart(&first, Some("Coordinate with qa."))
            .await
            .unwrap();

        let second = outcome.record().unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.subtask_id.as_deref(), Some("backend"));
        assert_ne!(second.workspace_path, first.workspace_path);
        assert_eq!(h.workspaces.removed(), vec![first.workspace_path.clone().unwrap()]);
        assert!(h.worker.launches()[1].prompt.contains("Coordinate with qa."));

        let agents = h.sessions.agents().await.unwrap();
        let old = agents.iter().find(|a| a.id == first.id).unwrap();
        assert_eq!(old.status, AgentStatus::Stopped);
        assert!(old.workspace_released);
    }

    #[tokio::test]
    async fn workspace_is_released_exactly_once() {
        let h = harness(LimitsConfig::default());
        let record = h.supervisor.spawn(&backend_task()).await.record().unwrap().clone();

        h.supervisor.kill(&record).await.unwrap();
        assert!(!h.supervisor.release_workspace(&record).await.unwrap());
        assert_eq!(h.workspaces.removed().len(), 1);
        assert_eq!(
            h.sessions.agents().await.unwrap()[0].status,
            AgentStatus::Failed
        );
    }

    #[tokio::test]
    async fn paused_agent_can_be_resumed() {
        let h = harness(LimitsConfig::default());
        let record = h.supervisor.spawn(&backend_task()).await.record().unwrap().clone();
        let pid = record.pid.unwrap();

        h.supervisor.pause(&record).await.unwrap();
        assert!(h.inspector.is_paused(pid));
        assert!(h.sessions.agents().await.unwrap()[0].paused);

        let resumed = h.supervisor.resume_all().await.unwrap();

        assert_eq!(resumed.len(), 1);
        assert!(!resumed[0].paused);
        assert!(!h.inspector.is_paused(pid));
        assert_eq!(h.inspector.signals_for(pid), vec![Signal::Pause, Signal::Resume]);
        assert!(h.supervisor.resume_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_of_unknown_pid_fails() {
        let h = harness(LimitsConfig::default());
        let err = h.supervisor.resume(4321).await.unwrap_err();
        assert!(matches!(err, EngineError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_spawns_respect_concurrency_cap() {
        let h = harness(LimitsConfig {
            max_agents: 2,
            ..LimitsConfig::default()
        });
        let mut set = tokio::task::JoinSet::new();
        for i in 0..4 {
            let supervisor = Arc::clone(&h.supervisor);
            set.spawn(async move {
                supervisor
                    .spawn(&Subtask::new(format!("t{i}"), Role::General, "work"))
                    .await
            });
        }
        let outcomes = set.join_all().await;

        let spawned = outcomes.iter().filter(|o| matches!(o, SpawnOutcome::Spawned(_))).count();
        let denied = outcomes.iter().filter(|o| matches!(o, SpawnOutcome::Denied { .. })).count();
        assert_eq!(spawned, 2);
        assert_eq!(denied, 2);
        assert_eq!(h.sessions.running_agents().await.unwrap().len(), 2);
    }
}
