//! Operator-gated recovery for unhealthy agents and conflicts.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::RecoveryAction;
use conductor_core::config::MonitorConfig;
use tracing::{info, warn};

use super::conflict::{Conflict, ConflictKind, ConflictOption};
use super::decision::DecisionBroker;
use super::monitor::HealthIssue;
use super::notify::{Notification, Notifier};
use crate::error::Result;
use crate::session::AgentRecord;
use crate::supervisor::{SpawnOutcome, WorkerSupervisor};
use crate::workspace::WorkspaceBackend;

/// Lines of worker log included in a debug report.
const DEBUG_LOG_LINES: usize = 40;

/// What happened to an agent after an interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Terminated and resubmitted; `replacement` is the new agent, if any.
    Restarted { replacement: Option<String> },
    Killed,
    /// Left running.
    Continued,
}

/// Read-only diagnostics for one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugReport {
    pub agent_id: String,
    pub log_tail: Vec<String>,
    pub changed_files: Vec<String>,
}

/// Result of [`InterruptController::handle_issue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledIssue {
    pub agent_id: String,
    pub action: RecoveryAction,
    /// The default action applied because nobody answered.
    pub timed_out: bool,
    pub outcome: InterruptOutcome,
    pub report: Option<DebugReport>,
}

/// Result of [`InterruptController::resolve_conflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolution {
    pub option: ConflictOption,
    pub timed_out: bool,
    /// Agents the option acted on.
    pub affected: Vec<String>,
}

/// Notifies, asks, then acts.
pub struct InterruptController {
    supervisor: Arc<WorkerSupervisor>,
    workspaces: Arc<dyn WorkspaceBackend>,
    notifier: Arc<dyn Notifier>,
    actions: DecisionBroker<RecoveryAction>,
    conflicts: DecisionBroker<ConflictOption>,
    decision_timeout: Duration,
    default_action: RecoveryAction,
    default_conflict_option: ConflictOption,
}

impl InterruptController {
    pub fn new(
        config: &MonitorConfig,
        supervisor: Arc<WorkerSupervisor>,
        workspaces: Arc<dyn WorkspaceBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            supervisor,
            workspaces,
            notifier,
            actions: DecisionBroker::new(),
            conflicts: DecisionBroker::new(),
            decision_timeout: config.decision_timeout(),
            default_action: config.default_action,
            default_conflict_option: ConflictOption::default(),
        }
    }

    /// Broker for recovery-action decisions.
    pub const fn actions(&self) -> &DecisionBroker<RecoveryAction> {
        &self.actions
    }

    /// Broker for conflict decisions.
    pub const fn conflicts(&self) -> &DecisionBroker<ConflictOption> {
        &self.conflicts
    }

    pub async fn handle_issue(&self, issue: &HealthIssue) -> Result<HandledIssue> {
        let agent = &issue.agent;
        let summary = format!(
            "Agent {} ({}, pid {}) is {}",
            agent.id,
            agent.role,
            agent.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
            issue.state
        );
        self.notifier
            .notify(&Notification::warning("Agent needs attention", summary.clone()).for_agents([agent.id.as_str()]));

        let decision = self
            .actions
            .request(
                summary,
                RecoveryAction::ALL.to_vec(),
                self.default_action,
                self.decision_timeout,
            )
            .await;
        info!(
            agent_id = %agent.id,
            action = %decision.value,
            timed_out = decision.timed_out,
            "Applying recovery action"
        );

        let mut report = None;
        let outcome = match decision.value {
            RecoveryAction::Restart => {
                let spawned = self.supervisor.restart(agent, None).await?;
                if !spawned.is_success() {
                    warn!(agent_id = %agent.id, reason = %spawned.failure_reason(), "Replacement agent did not start");
                }
                InterruptOutcome::Restarted {
                    replacement: spawned.record().map(|r| r.id.clone()),
                }
            }
            RecoveryAction::Kill => {
                self.supervisor.kill(agent).await?;
                InterruptOutcome::Killed
            }
            RecoveryAction::Debug => {
                let debug = self.debug_report(agent).await;
                self.notifier.notify(
                    &Notification::info(format!("Debug report for {}", agent.id), render_report(&debug))
                        .for_agents([agent.id.as_str()]),
                );
                report = Some(debug);
                InterruptOutcome::Continued
            }
            RecoveryAction::Continue => InterruptOutcome::Continued,
        };

        Ok(HandledIssue {
            agent_id: agent.id.clone(),
            action: decision.value,
            timed_out: decision.timed_out,
            outcome,
            report,
        })
    }

    /// Log tail and changed files. Never changes state.
    pub async fn debug_report(&self, agent: &AgentRecord) -> DebugReport {
        let log_tail = match &agent.log_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(content) => last_lines(&content, DEBUG_LOG_LINES),
                Err(e) => vec![format!("<log unavailable: {e}>")],
            },
            None => Vec::new(),
        };
        let changed_files = match &agent.workspace_path {
            Some(path) if path.exists() => self.workspaces.changed_files(path).await.unwrap_or_else(|e| {
                warn!(agent_id = %agent.id, error = %e, "Cannot list workspace changes");
                Vec::new()
            }),
            _ => Vec::new(),
        };
        DebugReport {
            agent_id: agent.id.clone(),
            log_tail,
            changed_files,
        }
    }

    pub async fn resolve_conflict(&self, conflict: &Conflict) -> Result<ConflictResolution> {
        let summary = conflict.summary();
        self.notifier
            .notify(&Notification::warning("Agent conflict", summary.clone()).for_agents(conflict.agent_ids()));

        let decision = self
            .conflicts
            .request(
                summary,
                ConflictOption::ALL.to_vec(),
                self.default_conflict_option,
                self.decision_timeout,
            )
            .await;
        info!(
            conflict = conflict.kind.name(),
            option = %decision.value,
            timed_out = decision.timed_out,
            "Resolving conflict"
        );

        let affected = match decision.value {
            ConflictOption::PauseAgents => self.pause_agents(&conflict.agents).await,
            ConflictOption::ManualMerge => {
                let workspaces: Vec<String> = conflict
                    .agents
                    .iter()
                    .filter_map(|a| a.workspace_path.as_ref())
                    .map(|p| p.display().to_string())
                    .collect();
                self.notifier.notify(
                    &Notification::warning(
                        "Manual merge requested",
                        format!("Merge the work in: {}", workspaces.join(", ")),
                    )
                    .for_agents(conflict.agent_ids()),
                );
                conflict.agent_ids()
            }
            ConflictOption::RestartGroup => self.restart_group(conflict).await?,
            ConflictOption::Ignore => Vec::new(),
        };

        Ok(ConflictResolution {
            option: decision.value,
            timed_out: decision.timed_out,
            affected,
        })
    }

    async fn pause_agents(&self, agents: &[AgentRecord]) -> Vec<String> {
        let mut paused = Vec::new();
        for agent in agents {
            match self.supervisor.pause(agent).await {
                Ok(()) => paused.push(agent.id.clone()),
                Err(e) => warn!(agent_id = %agent.id, pid = ?agent.pid, error = %e, "Failed to pause agent"),
            }
        }
        paused
    }

    async fn restart_group(&self, conflict: &Conflict) -> Result<Vec<String>> {
        let note = coordination_note(conflict);
        let mut restarted = Vec::new();
        for agent in &conflict.agents {
            match self.supervisor.restart(agent, Some(&note)).await? {
                SpawnOutcome::Denied { reasons } => {
                    warn!(agent_id = %agent.id, ?reasons, "Restart denied by resource governor");
                }
                outcome => {
                    if let Some(record) = outcome.record() {
                        restarted.push(record.id.clone());
                    }
                }
            }
        }
        Ok(restarted)
    }
}

fn coordination_note(conflict: &Conflict) -> String {
    let roles: Vec<String> = conflict.agents.iter().map(|a| a.role.to_string()).collect();
    match &conflict.kind {
        ConflictKind::FileConflict { paths } => format!(
            "Agents {} previously collided on {}. Stay within your role's files and commit small changes.",
            roles.join(", "),
            paths.join(", ")
        ),
        ConflictKind::ResourceContention { .. } => {
            "The host was overloaded. Avoid running heavy builds in parallel with other agents.".to_string()
        }
        ConflictKind::DependencyDeadlock { subtasks } => format!(
            "Subtasks {} were waiting on each other. Finish your part without waiting on them.",
            subtasks.join(", ")
        ),
    }
}

fn render_report(report: &DebugReport) -> String {
    let files = if report.changed_files.is_empty() {
        "none".to_string()
    } else {
        report.changed_files.join(", ")
    };
    format!(
        "changed files: {files}\n--- log tail ---\n{}",
        report.log_tail.join("\n")
    )
}

fn last_lines(content: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| (*l).to_string())
        .collect()
}
