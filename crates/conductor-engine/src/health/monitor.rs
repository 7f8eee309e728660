//! Periodic health checks over running agents.
//!
//! Each poll classifies every running agent from its process state, memory
//! and the last time its log file grew. Healthy agents are left alone; the
//! poll only writes to the session when a process has died. Threshold
//! crossings go to the [`InterruptController`], which asks the operator and
//! applies the answer (or the default after the decision timeout).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_core::config::MonitorConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::conflict::{self, Conflict};
use super::interrupt::{ConflictResolution, HandledIssue, InterruptController, InterruptOutcome};
use super::timer::PeriodicTimer;
use crate::error::Result;
use crate::process::ProcessInspector;
use crate::resources::ResourceGovernor;
use crate::session::{AgentRecord, AgentStatus, SessionStore};
use crate::workspace::WorkspaceBackend;

/// Health classification of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Stuck { idle: Duration },
    MemoryExcessive { memory_mb: u64 },
    Dead,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Stuck { idle } => write!(f, "stuck (no activity for {}s)", idle.as_secs()),
            Self::MemoryExcessive { memory_mb } => write!(f, "using too much memory ({memory_mb} MB)"),
            Self::Dead => f.write_str("dead"),
        }
    }
}

/// What one poll saw of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub alive: bool,
    pub memory_mb: Option<u64>,
    /// Time since the last observed activity.
    pub idle: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub stuck: Duration,
    pub memory_mb: u64,
}

impl From<&MonitorConfig> for Thresholds {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            stuck: config.stuck_threshold(),
            memory_mb: config.memory_threshold_mb,
        }
    }
}

/// Dead wins over memory, memory over stuck.
pub fn classify(observation: &Observation, thresholds: &Thresholds) -> HealthState {
    if !observation.alive {
        return HealthState::Dead;
    }
    if let Some(memory_mb) = observation.memory_mb
        && memory_mb > thresholds.memory_mb
    {
        return HealthState::MemoryExcessive { memory_mb };
    }
    if observation.idle > thresholds.stuck {
        return HealthState::Stuck {
            idle: observation.idle,
        };
    }
    HealthState::Healthy
}

/// An agent over a threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthIssue {
    pub agent: AgentRecord,
    pub state: HealthState,
}

/// Outcome of one poll.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Pids terminated for exceeding the concurrency cap.
    pub over_limit: Vec<u32>,
    pub checked: usize,
    /// Agents whose process was gone; now `stopped`.
    pub dead: Vec<String>,
    pub handled: Vec<HandledIssue>,
    /// Unhealthy agents skipped because the operator chose to continue.
    pub snoozed: Vec<String>,
    /// Suspended agents; their idle time is not checked.
    pub paused: Vec<String>,
    pub conflicts: Vec<ConflictResolution>,
}

/// Last time the agent showed activity: its log's mtime, else its start.
pub fn last_activity(agent: &AgentRecord) -> DateTime<Utc> {
    agent
        .log_path
        .as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .and_then(|m| m.modified().ok())
        .map(DateTime::<Utc>::from)
        .map_or(agent.start_time, |modified| modified.max(agent.start_time))
}

pub struct HealthMonitor {
    config: MonitorConfig,
    governor: Arc<ResourceGovernor>,
    sessions: Arc<SessionStore>,
    inspector: Arc<dyn ProcessInspector>,
    workspaces: Arc<dyn WorkspaceBackend>,
    interrupts: Arc<InterruptController>,
    /// Agent ids and conflict signatures not to alert on before the deadline.
    snoozed: Mutex<HashMap<String, Instant>>,
}

impl HealthMonitor {
    pub fn new(
        config: MonitorConfig,
        governor: Arc<ResourceGovernor>,
        sessions: Arc<SessionStore>,
        inspector: Arc<dyn ProcessInspector>,
        workspaces: Arc<dyn WorkspaceBackend>,
        interrupts: Arc<InterruptController>,
    ) -> Self {
        Self {
            config,
            governor,
            sessions,
            inspector,
            workspaces,
            interrupts,
            snoozed: Mutex::new(HashMap::new()),
        }
    }

    pub const fn interrupts(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    pub fn observe(&self, agent: &AgentRecord) -> Observation {
        let alive = agent.pid.is_some_and(|pid| self.inspector.is_alive(pid));
        let idle = (Utc::now() - last_activity(agent))
            .to_std()
            .unwrap_or(Duration::ZERO);
        Observation {
            alive,
            memory_mb: agent.pid.and_then(|pid| self.inspector.resident_memory_mb(pid)),
            idle,
        }
    }

    /// Enforce the concurrency cap, then check every running agent once.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let thresholds = Thresholds::from(&self.config);
        let over_limit = self.governor.enforce_limits().await?;
        let agents: Vec<AgentRecord> = self
            .sessions
            .running_agents()
            .await?
            .into_iter()
            .filter(|a| a.pid.is_some())
            .collect();

        let mut report = PollReport {
            over_limit,
            checked: agents.len(),
            ..PollReport::default()
        };
        self.forget_finished(&agents).await;

        let mut live = Vec::with_capacity(agents.len());
        let mut issues = Vec::new();
        for agent in agents {
            let state = classify(&self.observe(&agent), &thresholds);
            match state {
                HealthState::Dead => {
                    if self
                        .sessions
                        .finish_if_running(&agent.id, AgentStatus::Stopped)
                        .await?
                    {
                        info!(agent_id = %agent.id, pid = ?agent.pid, "Agent process gone, marked stopped");
                    }
                    report.dead.push(agent.id);
                }
                HealthState::Healthy | HealthState::Stuck { .. } if agent.paused => {
                    debug!(agent_id = %agent.id, "Agent paused, skipping activity check");
                    report.paused.push(agent.id);
                }
                HealthState::Healthy => live.push(agent),
                HealthState::Stuck { .. } | HealthState::MemoryExcessive { .. } => {
                    if self.is_snoozed(&agent.id).await {
                        debug!(agent_id = %agent.id, %state, "Unhealthy agent snoozed");
                        report.snoozed.push(agent.id.clone());
                    } else {
                        warn!(agent_id = %agent.id, role = %agent.role, %state, "Agent crossed health threshold");
                        issues.push(HealthIssue {
                            agent: agent.clone(),
                            state,
                        });
                    }
                    live.push(agent);
                }
            }
        }

        for issue in &issues {
            let handled = self.interrupts.handle_issue(issue).await?;
            match handled.outcome {
                InterruptOutcome::Continued => self.snooze(&handled.agent_id).await,
                InterruptOutcome::Restarted { .. } | InterruptOutcome::Killed => {
                    live.retain(|a| a.id != handled.agent_id);
                }
            }
            report.handled.push(handled);
        }

        if self.config.detect_conflicts {
            for conflict in self.detect_conflicts(&live).await {
                let signature = conflict.signature();
                if self.is_snoozed(&signature).await {
                    continue;
                }
                let resolution = self.interrupts.resolve_conflict(&conflict).await?;
                self.snooze(&signature).await;
                report.conflicts.push(resolution);
            }
        }

        debug!(
            over_limit = report.over_limit.len(),
            checked = report.checked,
            dead = report.dead.len(),
            handled = report.handled.len(),
            conflicts = report.conflicts.len(),
            "Health poll finished"
        );
        Ok(report)
    }

    /// Run [`poll_once`](Self::poll_once) every poll interval.
    ///
    /// Cancelling the returned timer stops the loop; workers keep running.
    pub fn start(self: &Arc<Self>) -> PeriodicTimer {
        let mut timer = PeriodicTimer::new(self.config.poll_interval());
        let monitor = Arc::clone(self);
        timer.start(move || {
            let monitor = Arc::clone(&monitor);
            async move {
                if let Err(e) = monitor.poll_once().await {
                    error!(error = %e, "Health poll failed");
                }
            }
        });
        info!(interval_secs = self.config.poll_interval_secs, "Health monitor started");
        timer
    }

    async fn detect_conflicts(&self, live: &[AgentRecord]) -> Vec<Conflict> {
        let mut changes = Vec::new();
        for agent in live {
            let Some(path) = agent.workspace_path.as_ref().filter(|p| p.exists()) else {
                continue;
            };
            match self.workspaces.changed_files(path).await {
                Ok(files) => changes.push((agent.clone(), files)),
                Err(e) => debug!(agent_id = %agent.id, error = %e, "Cannot list workspace changes"),
            }
        }

        let mut conflicts = conflict::detect_file_conflicts(&changes);
        conflicts.extend(conflict::detect_contention(
            live,
            self.inspector.load_average(),
            self.inspector.cpu_count(),
            self.governor.limits().load_factor,
        ));
        conflicts
    }

    async fn is_snoozed(&self, key: &str) -> bool {
        self.snoozed
            .lock()
            .await
            .get(key)
            .is_some_and(|until| Instant::now() < *until)
    }

    async fn snooze(&self, key: &str) {
        let until = Instant::now() + self.config.stuck_threshold();
        self.snoozed.lock().await.insert(key.to_string(), until);
    }

    /// Drop snoozes of agents that are no longer running.
    async fn forget_finished(&self, running: &[AgentRecord]) {
        let ids: HashSet<&str> = running.iter().map(|a| a.id.as_str()).collect();
        let now = Instant::now();
        self.snoozed
            .lock()
            .await
            .retain(|key, until| ids.contains(key.as_str()) || (key.contains(':') && *until > now));
    }
}
