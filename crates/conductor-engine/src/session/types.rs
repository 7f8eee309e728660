//! Session document types.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestration::Role;

/// Lifecycle state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl AgentStatus {
    /// Whether the agent may still own a live process.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

/// Durable record of one spawned (or directly executed) worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    #[serde(default)]
    pub subtask_id: Option<String>,
    pub role: Role,
    /// `None` when the task ran synchronously without a process.
    pub pid: Option<u32>,
    pub workspace_path: Option<PathBuf>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    pub task: String,
    pub status: AgentStatus,
    pub start_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_directly: bool,
    #[serde(default)]
    pub workspace_released: bool,
    /// Suspended by a conflict resolution until resumed.
    #[serde(default)]
    pub paused: bool,
}

impl AgentRecord {
    /// New running record with a fresh id.
    pub fn new(role: Role, task: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subtask_id: None,
            role,
            pid: None,
            workspace_path: None,
            branch: None,
            log_path: None,
            task: task.into(),
            status: AgentStatus::Running,
            start_time: Utc::now(),
            completion_time: None,
            executed_directly: false,
            workspace_released: false,
            paused: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_active()
    }

    /// Workspace that still has to be released.
    pub fn pending_workspace(&self) -> Option<&PathBuf> {
        if self.workspace_released {
            None
        } else {
            self.workspace_path.as_ref()
        }
    }

    pub(crate) fn finish(&mut self, status: AgentStatus, at: DateTime<Utc>) {
        self.status = status;
        if !status.is_active() && self.completion_time.is_none() {
            self.completion_time = Some(at);
        }
    }
}

/// The authoritative registry for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "session_id")]
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub task_description: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
}

impl Session {
    pub fn new(task_description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            task_description: task_description.into(),
            status: SessionStatus::Active,
            agents: Vec::new(),
        }
    }

    pub fn running_agents(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.iter().filter(|a| a.is_running())
    }

    /// Most recent record for `pid`.
    pub fn agent_by_pid(&self, pid: u32) -> Option<&AgentRecord> {
        self.agents.iter().rev().find(|a| a.pid == Some(pid))
    }

    pub fn agent_by_id(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub(crate) fn agent_by_pid_mut(&mut self, pid: u32) -> Option<&mut AgentRecord> {
        self.agents.iter_mut().rev().find(|a| a.pid == Some(pid))
    }

    pub(crate) fn agent_by_id_mut(&mut self, id: &str) -> Option<&mut AgentRecord> {
        self.agents.iter_mut().find(|a| a.id == id)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn document_uses_session_id_key() {
        let session = Session::new("build it");
        let json = serde_json::to_value(&session).unwrap();
        assert!(json.get("session_id").is_some());
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn minimal_agent_entry_loads_with_defaults() {
        let json = r#"{
            "session_id": "s1",
            "start_time": "2026-01-01T00:00:00Z",
            "task_description": "t",
            "status": "active",
            "agents": [{
                "id": "a1", "role": "qa", "pid": 10, "workspace_path": null,
                "task": "test", "status": "running",
                "start_time": "2026-01-01T00:00:00Z", "completion_time": null
            }]
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        let agent = &session.agents[0];
        assert_eq!(agent.role, Role::Qa);
        assert!(!agent.executed_directly);
        assert!(!agent.workspace_released);
        assert!(agent.is_running());
    }

    #[test]
    fn finish_sets_completion_time_once() {
        let mut record = AgentRecord::new(Role::Backend, "api");
        let first = Utc::now();
        record.finish(AgentStatus::Stopped, first);
        record.finish(AgentStatus::Failed, first + chrono::Duration::seconds(5));
        assert_eq!(record.status, AgentStatus::Failed);
        assert_eq!(record.completion_time, Some(first));
    }
}
