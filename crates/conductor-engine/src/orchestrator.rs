//! Service container wiring every engine component from one [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::Config;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cleanup::{CleanupManager, CleanupReport, SweepReport};
use crate::decompose::TaskDecomposer;
use crate::error::Result;
use crate::health::{
    Conflict, ConflictResolution, HealthMonitor, InterruptController, LogNotifier, Notifier, PeriodicTimer,
};
use crate::orchestration::{ExecutionPlan, PhaseScheduler, PlanResult, ProjectContext, RetryPolicy, Stagger};
use crate::process::{ProcessInspector, SystemInspector};
use crate::resources::{ResourceGovernor, ResourceSnapshot};
use crate::session::{AgentRecord, ReconcileReport, Session, SessionStore};
use crate::supervisor::{CliWorkerBackend, WorkerBackend, WorkerSupervisor};
use crate::workspace::{GitWorktreeBackend, WorkspaceBackend};

/// Capabilities the engine talks to the outside world through.
pub struct Backends {
    pub inspector: Arc<dyn ProcessInspector>,
    pub workspaces: Arc<dyn WorkspaceBackend>,
    pub worker: Arc<dyn WorkerBackend>,
    pub notifier: Arc<dyn Notifier>,
}

impl Backends {
    /// `/proc` inspection, git worktrees and the configured worker tool.
    pub fn system(config: &Config, project_root: &Path) -> Self {
        Self {
            inspector: Arc::new(SystemInspector::new()),
            workspaces: Arc::new(GitWorktreeBackend::new(
                project_root,
                config.paths.workspace_dir(project_root),
            )),
            worker: Arc::new(CliWorkerBackend::new(config.worker.clone())),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Result of [`Orchestrator::run`].
#[derive(Debug)]
pub struct RunReport {
    pub session_id: String,
    pub plan: ExecutionPlan,
    pub result: PlanResult,
    /// Operator decision on subtasks that could never be scheduled.
    pub deadlock: Option<ConflictResolution>,
    /// Cleanup performed for subtasks whose spawn failed.
    pub cleanup: CleanupReport,
}

/// Result of [`Orchestrator::status`].
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub session: Session,
    pub resources: ResourceSnapshot,
}

pub struct Orchestrator {
    project: ProjectContext,
    state_dir: PathBuf,
    inspector: Arc<dyn ProcessInspector>,
    sessions: Arc<SessionStore>,
    governor: Arc<ResourceGovernor>,
    supervisor: Arc<WorkerSupervisor>,
    decomposer: TaskDecomposer,
    scheduler: PhaseScheduler,
    interrupts: Arc<InterruptController>,
    monitor: Arc<HealthMonitor>,
    cleanup: CleanupManager,
}

impl Orchestrator {
    /// Production wiring for `project`.
    pub fn new(config: &Config, project: ProjectContext) -> Self {
        let backends = Backends::system(config, &project.root);
        Self::with_backends(config, project, backends)
    }

    pub fn with_backends(config: &Config, project: ProjectContext, backends: Backends) -> Self {
        let Backends {
            inspector,
            workspaces,
            worker,
            notifier,
        } = backends;
        let state_dir = config.paths.state_dir(&project.root);
        let sessions = Arc::new(SessionStore::new(&state_dir));
        let governor = Arc::new(ResourceGovernor::new(
            config.limits.clone(),
            Arc::clone(&sessions),
            Arc::clone(&inspector),
            workspaces.base_dir(),
        ));

        let stagger = Stagger::new(
            Duration::from_millis(config.spawn.jitter_min_ms),
            Duration::from_millis(config.spawn.jitter_max_ms),
        );
        let supervisor = Arc::new(
            WorkerSupervisor::new(
                Arc::clone(&governor),
                Arc::clone(&sessions),
                Arc::clone(&workspaces),
                worker,
                Arc::clone(&inspector),
                project.clone(),
                &state_dir,
            )
            .with_grace_period(config.monitor.grace_period()),
        );
        let scheduler = PhaseScheduler::new(supervisor.clone())
            .with_retry(RetryPolicy::from_config(&config.spawn))
            .with_stagger(stagger)
            .with_phase_pause(config.spawn.phase_pause());

        let interrupts = Arc::new(InterruptController::new(
            &config.monitor,
            Arc::clone(&supervisor),
            Arc::clone(&workspaces),
            notifier,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            config.monitor.clone(),
            Arc::clone(&governor),
            Arc::clone(&sessions),
            Arc::clone(&inspector),
            Arc::clone(&workspaces),
            Arc::clone(&interrupts),
        ));
        let cleanup = CleanupManager::new(
            Arc::clone(&sessions),
            workspaces,
            Arc::clone(&inspector),
            &state_dir,
            config.cleanup.step_timeout(),
        );

        Self {
            project,
            state_dir,
            inspector,
            sessions,
            governor,
            supervisor,
            decomposer: TaskDecomposer::new(),
            scheduler,
            interrupts,
            monitor,
            cleanup,
        }
    }

    pub const fn project(&self) -> &ProjectContext {
        &self.project
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub const fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub const fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub const fn interrupts(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    pub const fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub const fn cleanup(&self) -> &CleanupManager {
        &self.cleanup
    }

    /// Decompose `task` without touching the session.
    pub fn plan(&self, task: &str) -> ExecutionPlan {
        self.decomposer.decompose(task, &self.project)
    }

    /// Start a session for `task`, decompose it and spawn every phase.
    ///
    /// Returns once all spawns were issued; workers keep running. Agents of
    /// the previous session that are still alive stay in the new one.
    pub async fn run(&self, task: &str) -> Result<RunReport> {
        self.reconcile().await?;
        let session = self.sessions.create(task).await?;
        let plan = self.plan(task);
        info!(
            session_id = %session.id,
            task_type = ?plan.task_type,
            phases = plan.phases.len(),
            subtasks = plan.subtask_count(),
            "Running task"
        );
        self.execute(session.id, plan).await
    }

    /// Execute an already built plan in the current session.
    pub async fn execute(&self, session_id: String, plan: ExecutionPlan) -> Result<RunReport> {
        let deadlock = match plan.remainder_error() {
            Some(e) => {
                error!(error = %e, "Plan is truncated");
                let conflict = Conflict::deadlock(plan.unscheduled_ids(), Vec::new());
                Some(self.interrupts.resolve_conflict(&conflict).await?)
            }
            None => None,
        };

        let result = self.scheduler.execute(&plan).await;
        let cleanup = self.cleanup_failed(&result).await?;
        Ok(RunReport {
            session_id,
            plan,
            result,
            deadlock,
            cleanup,
        })
    }

    /// Clean up the leftovers of subtasks that did not produce a worker.
    async fn cleanup_failed(&self, result: &PlanResult) -> Result<CleanupReport> {
        let failed = result.failed();
        let mut report = CleanupReport::default();
        if failed.is_empty() {
            return Ok(report);
        }
        for agent in self.sessions.agents().await? {
            let is_failed = agent
                .subtask_id
                .as_ref()
                .is_some_and(|id| failed.contains(id));
            if is_failed && !agent.is_running() {
                warn!(agent_id = %agent.id, subtask = ?agent.subtask_id, "Cleaning up failed subtask");
                report.steps.extend(self.cleanup.cleanup_agent(&agent).await?.steps);
            }
        }
        Ok(report)
    }

    /// Reconciled session plus current resource usage.
    pub async fn status(&self) -> Result<StatusReport> {
        self.sessions.reconcile(self.inspector.as_ref()).await?;
        Ok(StatusReport {
            session: self.sessions.load().await?,
            resources: self.governor.snapshot().await?,
        })
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.sessions.reconcile(self.inspector.as_ref()).await
    }

    /// Kill agents beyond the concurrency cap.
    pub async fn enforce_limits(&self) -> Result<Vec<u32>> {
        self.governor.enforce_limits().await
    }

    pub async fn stop(&self, pid: u32) -> Result<()> {
        self.supervisor.stop(pid).await
    }

    /// Continue one paused agent, or every paused agent when `pid` is `None`.
    pub async fn resume(&self, pid: Option<u32>) -> Result<Vec<AgentRecord>> {
        match pid {
            Some(pid) => Ok(vec![self.supervisor.resume(pid).await?]),
            None => self.supervisor.resume_all().await,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.cleanup.sweep().await
    }

    /// Archive the session and clear the active document.
    pub async fn archive(&self) -> Result<PathBuf> {
        self.sessions.archive_and_clear().await
    }

    /// Start the background health loop. Dropping or cancelling the timer
    /// leaves workers running.
    pub fn start_monitor(&self) -> PeriodicTimer {
        self.monitor.start()
    }

    /// Mark the session completed once no agent is running.
    pub async fn complete_if_idle(&self) -> Result<bool> {
        self.reconcile().await?;
        if self.sessions.running_agents().await?.is_empty() {
            self.sessions.complete().await?;
            info!("All agents finished, session completed");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
