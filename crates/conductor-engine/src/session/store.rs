//! File-backed session store.
//!
//! The session document on disk is the single source of truth. Every mutation
//! re-reads the document, applies the change and writes it back through a
//! temp file + rename while holding an async mutex, so the spawn path, the
//! health monitor and the exit watchers never interleave partial updates.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::types::{AgentRecord, AgentStatus, Session, SessionStatus};
use crate::error::{EngineError, Result};
use crate::process::ProcessInspector;

const SESSION_FILE: &str = "session.json";
const ARCHIVE_DIR: &str = "archive";

/// Records touched by one `reconcile` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pids found dead and moved to `stopped`.
    pub stopped: Vec<u32>,
    /// Active records without a pid that were closed out.
    pub orphaned: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty() && self.orphaned.is_empty()
    }
}

/// Durable registry of agent records for one working directory.
#[derive(Debug)]
pub struct SessionStore {
    state_dir: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.state_dir.join(SESSION_FILE)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.state_dir.join(ARCHIVE_DIR)
    }

    /// Start a new session. A previous session with agents is archived first.
    ///
    /// Records still `running` move into the new session, so their workers
    /// keep counting against the limits and stay under health monitoring.
    /// Reconcile before calling this to drop the ones whose process is gone.
    pub async fn create(&self, task_description: &str) -> Result<Session> {
        let _guard = self.lock.lock().await;
        let path = self.path();
        let mut session = Session::new(task_description);
        if path.exists()
            && let Ok(previous) = read_session(&path)
            && !previous.agents.is_empty()
        {
            let archived = self.archive_file(&previous)?;
            info!(session_id = %previous.id, archive = %archived.display(), "Archived previous session");
            session.agents = previous.agents.into_iter().filter(AgentRecord::is_running).collect();
            if !session.agents.is_empty() {
                info!(carried = session.agents.len(), "Running agents carried into the new session");
            }
        }
        write_atomic(&path, &session)?;
        info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// Current session. Missing or corrupt documents yield a fresh one.
    pub async fn load(&self) -> Result<Session> {
        let _guard = self.lock.lock().await;
        self.load_locked()
    }

    pub async fn agents(&self) -> Result<Vec<AgentRecord>> {
        Ok(self.load().await?.agents)
    }

    pub async fn running_agents(&self) -> Result<Vec<AgentRecord>> {
        Ok(self
            .load()
            .await?
            .agents
            .into_iter()
            .filter(AgentRecord::is_running)
            .collect())
    }

    /// Register a record.
    ///
    /// A running record whose pid is already held by another running record
    /// supersedes it: the OS reused the pid, so the older one is stopped.
    pub async fn add_agent(&self, record: AgentRecord) -> Result<()> {
        self.mutate(|session| {
            let now = Utc::now();
            if record.is_running()
                && let Some(pid) = record.pid
            {
                for stale in session
                    .agents
                    .iter_mut()
                    .filter(|a| a.is_running() && a.pid == Some(pid))
                {
                    warn!(agent_id = %stale.id, pid, "Pid reused, stopping stale record");
                    stale.finish(AgentStatus::Stopped, now);
                }
            }
            session.agents.push(record);
            Ok(())
        })
        .await
    }

    /// Set the status of the most recent record for `pid`.
    ///
    /// Terminal statuses get `completion_time` (now when not given).
    pub async fn update_status(
        &self,
        pid: u32,
        status: AgentStatus,
        completion_time: Option<DateTime<Utc>>,
    ) -> Result<AgentRecord> {
        self.mutate(|session| {
            let record = session
                .agent_by_pid_mut(pid)
                .ok_or_else(|| EngineError::AgentNotFound {
                    id: format!("pid {pid}"),
                })?;
            record.finish(status, completion_time.unwrap_or_else(Utc::now));
            Ok(record.clone())
        })
        .await
    }

    pub async fn update_status_by_id(&self, id: &str, status: AgentStatus) -> Result<AgentRecord> {
        self.mutate(|session| {
            let record = session
                .agent_by_id_mut(id)
                .ok_or_else(|| EngineError::AgentNotFound { id: id.to_string() })?;
            record.finish(status, Utc::now());
            Ok(record.clone())
        })
        .await
    }

    /// Move an active record to `status`; no-op if something else already
    /// finished it. Returns whether the record changed.
    pub async fn finish_if_running(&self, id: &str, status: AgentStatus) -> Result<bool> {
        self.mutate(|session| {
            Ok(match session.agent_by_id_mut(id) {
                Some(record) if record.is_running() => {
                    record.finish(status, Utc::now());
                    true
                }
                _ => false,
            })
        })
        .await
    }

    pub async fn set_paused(&self, id: &str, paused: bool) -> Result<AgentRecord> {
        self.mutate(|session| {
            let record = session
                .agent_by_id_mut(id)
                .ok_or_else(|| EngineError::AgentNotFound { id: id.to_string() })?;
            record.paused = paused;
            Ok(record.clone())
        })
        .await
    }

    pub async fn remove_agent(&self, pid: u32) -> Result<Option<AgentRecord>> {
        self.mutate(|session| {
            let idx = session.agents.iter().rposition(|a| a.pid == Some(pid));
            Ok(idx.map(|i| session.agents.remove(i)))
        })
        .await
    }

    /// Claim the right to release an agent's workspace.
    ///
    /// Returns the path exactly once per record; later callers get `None`.
    pub async fn claim_workspace_release(&self, id: &str) -> Result<Option<PathBuf>> {
        self.mutate(|session| {
            let record = session
                .agent_by_id_mut(id)
                .ok_or_else(|| EngineError::AgentNotFound { id: id.to_string() })?;
            let path = record.pending_workspace().cloned();
            if path.is_some() {
                record.workspace_released = true;
            }
            Ok(path)
        })
        .await
    }

    /// Mark every running record whose process is gone as `stopped`.
    ///
    /// Never spawns or signals anything; a second pass with the same process
    /// table changes nothing.
    pub async fn reconcile(&self, inspector: &dyn ProcessInspector) -> Result<ReconcileReport> {
        let report = self
            .mutate(|session| {
                let now = Utc::now();
                let mut report = ReconcileReport::default();
                for record in session.agents.iter_mut().filter(|a| a.is_running()) {
                    match record.pid {
                        Some(pid) if !inspector.is_alive(pid) => {
                            record.finish(AgentStatus::Stopped, now);
                            report.stopped.push(pid);
                        }
                        Some(_) => {}
                        None => {
                            // A direct execution interrupted by a crash.
                            record.finish(AgentStatus::Stopped, now);
                            report.orphaned.push(record.id.clone());
                        }
                    }
                }
                Ok(report)
            })
            .await?;
        if !report.is_empty() {
            info!(
                stopped = report.stopped.len(),
                orphaned = report.orphaned.len(),
                "Reconciled session with process table"
            );
        }
        Ok(report)
    }

    pub async fn complete(&self) -> Result<()> {
        self.mutate(|session| {
            session.status = SessionStatus::Completed;
            Ok(())
        })
        .await
    }

    /// Copy the active session into the archive directory.
    pub async fn archive(&self) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let session = read_session(&self.path())?;
        self.archive_file(&session)
    }

    /// Archive, then delete the active document. Nothing is deleted if the
    /// archive copy fails.
    pub async fn archive_and_clear(&self) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let path = self.path();
        let session = read_session(&path)?;
        let archived = self.archive_file(&session)?;
        fs::remove_file(&path)?;
        info!(session_id = %session.id, archive = %archived.display(), "Session archived and cleared");
        Ok(archived)
    }

    /// Agent records of every archived session. Unreadable archives are
    /// skipped.
    pub async fn archived_agents(&self) -> Result<Vec<AgentRecord>> {
        let _guard = self.lock.lock().await;
        let dir = self.archive_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut agents = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_session(&path) {
                Ok(session) => agents.extend(session.agents),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable archive"),
            }
        }
        Ok(agents)
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().await;
        let mut session = self.load_locked()?;
        let value = f(&mut session)?;
        write_atomic(&self.path(), &session)?;
        Ok(value)
    }

    fn load_locked(&self) -> Result<Session> {
        let path = self.path();
        if !path.exists() {
            let session = Session::new("");
            write_atomic(&path, &session)?;
            return Ok(session);
        }
        match read_session(&path) {
            Ok(session) => Ok(session),
            Err(EngineError::SessionCorrupt { reason, .. }) => {
                let backup = corrupt_backup_path(&path);
                error!(
                    path = %path.display(),
                    backup = %backup.display(),
                    %reason,
                    "Session document corrupt, starting a fresh session"
                );
                if let Err(e) = fs::rename(&path, &backup) {
                    warn!(error = %e, "Failed to preserve corrupt session document");
                }
                let session = Session::new("");
                write_atomic(&path, &session)?;
                Ok(session)
            }
            Err(e) => Err(e),
        }
    }

    fn archive_file(&self, session: &Session) -> Result<PathBuf> {
        let dir = self.archive_dir();
        fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let target = dir.join(format!("session-{}-{stamp}.json", session.id));
        write_atomic(&target, session)?;
        Ok(target)
    }
}

fn read_session(path: &Path) -> Result<Session> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| EngineError::SessionCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, session: &Session) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, session)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| EngineError::Io(e.error))?;
    Ok(())
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{stamp}"));
    path.with_file_name(name)
}
