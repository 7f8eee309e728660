//! Fully faked engine wiring for unit tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::RecoveryAction;
use conductor_core::config::{LimitsConfig, MonitorConfig};
use tokio::task::JoinHandle;

use crate::health::{ConflictOption, HealthMonitor, InterruptController, RecordingNotifier};
use crate::orchestration::ProjectContext;
use crate::process::FakeInspector;
use crate::resources::ResourceGovernor;
use crate::session::SessionStore;
use crate::supervisor::{FakeWorkerBackend, WorkerSupervisor};
use crate::workspace::FakeWorkspaceBackend;

pub(crate) struct TestEngine {
    _dir: tempfile::TempDir,
    pub state_dir: PathBuf,
    pub monitor_config: MonitorConfig,
    pub inspector: Arc<FakeInspector>,
    pub sessions: Arc<SessionStore>,
    pub workspaces: Arc<FakeWorkspaceBackend>,
    pub governor: Arc<ResourceGovernor>,
    pub supervisor: Arc<WorkerSupervisor>,
    pub notifier: Arc<RecordingNotifier>,
    pub interrupts: Arc<InterruptController>,
}

impl TestEngine {
    pub fn new(monitor_config: MonitorConfig) -> Self {
        Self::with_limits(monitor_config, LimitsConfig::default())
    }

    pub fn with_limits(monitor_config: MonitorConfig, limits: LimitsConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let project_root = dir.path().to_path_buf();
        let state_dir = project_root.join(".conductor");

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
                Arc::clone(&governor),
                Arc::clone(&sessions),
                workspaces.clone(),
                worker,
                inspector.clone(),
                ProjectContext::new("generic", &project_root),
                &state_dir,
            )
            .with_grace_period(Duration::from_millis(300)),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let interrupts = Arc::new(InterruptController::new(
            &monitor_config,
            Arc::clone(&supervisor),
            workspaces.clone(),
            notifier.clone(),
        ));

        Self {
            _dir: dir,
            state_dir,
            monitor_config,
            inspector,
            sessions,
            workspaces,
            governor,
            supervisor,
            notifier,
            interrupts,
        }
    }

    pub fn monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.monitor_config.clone(),
            Arc::clone(&self.governor),
            Arc::clone(&self.sessions),
            self.inspector.clone(),
            self.workspaces.clone(),
            Arc::clone(&self.interrupts),
        )
    }

    /// Answer every recovery-action request with `action`.
    pub fn answer_actions(&self, action: RecoveryAction) -> JoinHandle<()> {
        let mut notices = self.interrupts.actions().subscribe();
        let interrupts = Arc::clone(&self.interrupts);
        tokio::spawn(async move {
            while let Ok(notice) = notices.recv().await {
                interrupts.actions().respond(&notice.request_id, action).await;
            }
        })
    }

    /// Answer every conflict request with `option`.
    pub fn answer_conflicts(&self, option: ConflictOption) -> JoinHandle<()> {
        let mut notices = self.interrupts.conflicts().subscribe();
        let interrupts = Arc::clone(&self.interrupts);
        tokio::spawn(async move {
            while let Ok(notice) = notices.recv().await {
                interrupts.conflicts().respond(&notice.request_id, option).await;
            }
        })
    }
}
