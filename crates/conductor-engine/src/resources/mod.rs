//! Admission control over spawn requests.
//!
//! The [`ResourceGovernor`] checks concurrency, memory, disk and load limits
//! before a worker may be spawned, and can shed the oldest agents when the
//! running count exceeds the cap.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use conductor_core::config::LimitsConfig;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::process::{self, ProcessInspector};
use crate::session::{AgentRecord, AgentStatus, SessionStore};

/// Point-in-time resource usage. Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub active_agents: usize,
    pub max_agents: usize,
    pub memory_usage_mb: u64,
    pub disk_usage_mb: u64,
    pub system_load: f64,
}

/// Limit categories checked on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Concurrency,
    Memory,
    Disk,
    Load,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Concurrency => "concurrency",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Load => "load",
        })
    }
}

/// Result of an admission check. `reasons` holds one entry per violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub violations: Vec<LimitKind>,
    pub reasons: Vec<String>,
}

/// Check a snapshot against the limits. Every violated limit is reported.
pub fn evaluate(snapshot: &ResourceSnapshot, limits: &LimitsConfig, cpus: usize) -> AdmissionDecision {
    let mut violations = Vec::new();
    let mut reasons = Vec::new();

    if snapshot.active_agents >= snapshot.max_agents {
        violations.push(LimitKind::Concurrency);
        reasons.push(format!(
            "concurrency limit reached: {}/{} agents running",
            snapshot.active_agents, snapshot.max_agents
        ));
    }
    if snapshot.memory_usage_mb >= limits.max_memory_mb {
        violations.push(LimitKind::Memory);
        reasons.push(format!(
            "memory limit reached: {}MB used by agents, limit {}MB",
            snapshot.memory_usage_mb, limits.max_memory_mb
        ));
    }
    if snapshot.disk_usage_mb >= limits.max_disk_mb {
        violations.push(LimitKind::Disk);
        reasons.push(format!(
            "disk limit reached: {}MB in workspaces, limit {}MB",
            snapshot.disk_usage_mb, limits.max_disk_mb
        ));
    }
    #[allow(clippy::cast_precision_loss)]
    let load_ceiling = cpus.max(1) as f64 * limits.load_factor;
    if snapshot.system_load >= load_ceiling {
        violations.push(LimitKind::Load);
        reasons.push(format!(
            "system load too high: {:.2} >= {load_ceiling:.2} ({cpus} cores x {})",
            snapshot.system_load, limits.load_factor
        ));
    }

    AdmissionDecision {
        allowed: violations.is_empty(),
        violations,
        reasons,
    }
}

/// Reservation held between admission and agent registration.
///
/// While alive it counts as one active agent, so concurrent spawns in the
/// same phase cannot overshoot the cap. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Admission control for worker spawns.
pub struct ResourceGovernor {
    limits: LimitsConfig,
    sessions: Arc<SessionStore>,
    inspector: Arc<dyn ProcessInspector>,
    /// Directory whose size counts against the disk limit.
    work_area: PathBuf,
    in_flight: Arc<AtomicUsize>,
    admit_lock: Mutex<()>,
}

impl ResourceGovernor {
    pub fn new(
        limits: LimitsConfig,
        sessions: Arc<SessionStore>,
        inspector: Arc<dyn ProcessInspector>,
        work_area: impl Into<PathBuf>,
    ) -> Self {
        info!(
            max_agents = limits.max_agents,
            max_memory_mb = limits.max_memory_mb,
            max_disk_mb = limits.max_disk_mb,
            "ResourceGovernor created"
        );
        Self {
            limits,
            sessions,
            inspector,
            work_area: work_area.into(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            admit_lock: Mutex::new(()),
        }
    }

    pub const fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Running agents whose process is still alive, oldest first.
    async fn live_agents(&self) -> Result<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> = self
            .sessions
            .running_agents()
            .await?
            .into_iter()
            .filter(|a| a.pid.is_some_and(|pid| self.inspector.is_alive(pid)))
            .collect();
        agents.sort_by_key(|a| a.start_time);
        Ok(agents)
    }

    /// Current usage. Read-only.
    pub async fn snapshot(&self) -> Result<ResourceSnapshot> {
        let agents = self.live_agents().await?;
        let memory_usage_mb = agents
            .iter()
            .filter_map(|a| a.pid)
            .filter_map(|pid| self.inspector.resident_memory_mb(pid))
            .sum();
        Ok(ResourceSnapshot {
            active_agents: agents.len() + self.in_flight.load(Ordering::SeqCst),
            max_agents: self.limits.max_agents,
            memory_usage_mb,
            disk_usage_mb: self.inspector.disk_usage_mb(&self.work_area),
            system_load: self.inspector.load_average().unwrap_or(0.0),
        })
    }

    /// Whether a new worker may be spawned now. Read-only and idempotent.
    pub async fn can_spawn(&self) -> Result<AdmissionDecision> {
        let snapshot = self.snapshot().await?;
        let decision = evaluate(&snapshot, &self.limits, self.inspector.cpu_count());
        if !decision.allowed {
            debug!(reasons = ?decision.reasons, "Spawn admission denied");
        }
        Ok(decision)
    }

    /// Check and reserve a slot atomically.
    pub async fn try_admit(&self) -> Result<std::result::Result<AdmissionPermit, AdmissionDecision>> {
        let _guard = self.admit_lock.lock().await;
        let decision = self.can_spawn().await?;
        if !decision.allowed {
            return Ok(Err(decision));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Ok(AdmissionPermit {
            in_flight: Arc::clone(&self.in_flight),
        }))
    }

    /// Kill the oldest agents above the concurrency cap.
    ///
    /// Returns the pids that were terminated; their records become `stopped`.
    pub async fn enforce_limits(&self) -> Result<Vec<u32>> {
        let agents = self.live_agents().await?;
        let excess = agents.len().saturating_sub(self.limits.max_agents);
        if excess == 0 {
            return Ok(Vec::new());
        }

        warn!(
            running = agents.len(),
            max_agents = self.limits.max_agents,
            excess,
            "Agent count above limit, terminating oldest"
        );
        let mut killed = Vec::with_capacity(excess);
        for agent in agents.iter().take(excess) {
            let Some(pid) = agent.pid else { continue };
            match process::force_kill(self.inspector.as_ref(), pid) {
                Ok(_) => {
                    self.sessions
                        .update_status(pid, AgentStatus::Stopped, None)
                        .await?;
                    info!(agent_id = %agent.id, pid, role = %agent.role, "Terminated excess agent");
                    killed.push(pid);
                }
                Err(e) => warn!(agent_id = %agent.id, pid, error = %e, "Failed to terminate excess agent"),
            }
        }
        Ok(killed)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::orchestration::Role;
    use crate::process::{FakeInspector, Signal};

    fn snapshot(active: usize, max: usize, mem: u64, disk: u64, load: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            active_agents: active,
            max_agents: max,
            memory_usage_mb: mem,
            disk_usage_mb: disk,
            system_load: load,
        }
    }

    fn limits(max_agents: usize) -> LimitsConfig {
        LimitsConfig {
            max_agents,
            max_memory_mb: 1000,
            max_disk_mb: 500,
            load_factor: 1.5,
        }
    }

    async fn governor(
        max_agents: usize,
    ) -> (tempfile::TempDir, Arc<SessionStore>, Arc<FakeInspector>, ResourceGovernor) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("state")));
        sessions.create("test").await.unwrap();
        let inspector = Arc::new(FakeInspector::new());
        let gov = ResourceGovernor::new(
            limits(max_agents),
            Arc::clone(&sessions),
            Arc::clone(&inspector) as Arc<dyn ProcessInspector>,
            dir.path().join("ws"),
        );
        (dir, sessions, inspector, gov)
    }

    async fn add_live_agent(sessions: &SessionStore, inspector: &FakeInspector, pid: u32, mem: u64) {
        inspector.spawn_process(pid, mem);
        let mut record = AgentRecord::new(Role::Backend, "work");
        record.pid = Some(pid);
        record.start_time = chrono::Utc::now() + chrono::Duration::seconds(i64::from(pid));
        sessions.add_agent(record).await.unwrap();
    }

    // =========================================================================
    // Pure evaluation
    // =========================================================================

    #[test]
    fn full_concurrency_is_denied_with_reason() {
        let decision = evaluate(&snapshot(10, 10, 0, 0, 0.0), &limits(10), 4);
        assert!(!decision.allowed);
        assert_eq!(decision.violations, vec![LimitKind::Concurrency]);
        assert!(decision.reasons[0].contains("concurrency"));
    }

    #[test]
    fn under_all_limits_is_allowed() {
        let decision = evaluate(&snapshot(2, 10, 100, 10, 1.0), &limits(10), 4);
        assert!(decision.allowed);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn denial_reports_every_violated_limit() {
        let l = limits(3);
        let cpus = 2;
        // Each bit toggles one limit over its threshold.
        for mask in 1_u8..16 {
            let snap = snapshot(
                if mask & 1 != 0 { 3 } else { 0 },
                3,
                if mask & 2 != 0 { 1000 } else { 0 },
                if mask & 4 != 0 { 500 } else { 0 },
                if mask & 8 != 0 { 3.0 } else { 0.0 },
            );
            let d = evaluate(&snap, &l, cpus);
            assert!(!d.allowed);
            assert_eq!(d.reasons.len(), d.violations.len());
            assert_eq!(d.violations.len(), mask.count_ones() as usize);
            for (bit, kind) in [
                (1, LimitKind::Concurrency),
                (2, LimitKind::Memory),
                (4, LimitKind::Disk),
                (8, LimitKind::Load),
            ] {
                assert_eq!(mask & bit != 0, d.violations.contains(&kind), "mask {mask:#06b}");
            }
        }
    }

    #[test]
    fn load_ceiling_scales_with_cores() {
        let l = limits(10);
        assert!(evaluate(&snapshot(0, 10, 0, 0, 5.9), &l, 4).allowed);
        assert!(!evaluate(&snapshot(0, 10, 0, 0, 6.0), &l, 4).allowed);
    }

    // =========================================================================
    // Governor
    // =========================================================================

    #[tokio::test]
    async fn can_spawn_denies_at_cap_and_is_idempotent() {
        let (_dir, sessions, inspector, gov) = governor(10).await;
        for pid in 1..=10 {
            add_live_agent(&sessions, &inspector, pid, 10).await;
        }

        let first = gov.can_spawn().await.unwrap();
        let second = gov.can_spawn().await.unwrap();
        assert!(!first.allowed);
        assert!(first.reasons.iter().any(|r| r.contains("concurrency")));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dead_agents_do_not_count() {
        let (_dir, sessions, inspector, gov) = governor(1).await;
        add_live_agent(&sessions, &inspector, 5, 10).await;
        inspector.exit_process(5);

        assert!(gov.can_spawn().await.unwrap().allowed);
    }

    #[tokio::test]
    async fn memory_sums_live_agents() {
        let (_dir, sessions, inspector, gov) = governor(10).await;
        add_live_agent(&sessions, &inspector, 1, 600).await;
        add_live_agent(&sessions, &inspector, 2, 400).await;

        let snap = gov.snapshot().await.unwrap();
        assert_eq!(snap.memory_usage_mb, 1000);
        let d = gov.can_spawn().await.unwrap();
        assert_eq!(d.violations, vec![LimitKind::Memory]);
    }

    #[tokio::test]
    async fn permits_count_until_dropped() {
        let (_dir, _sessions, _inspector, gov) = governor(1).await;

        let permit = gov.try_admit().await.unwrap().unwrap();
        assert!(gov.try_admit().await.unwrap().is_err());
        drop(permit);
        assert!(gov.try_admit().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn enforce_limits_kills_oldest_excess() {
        let (_dir, sessions, inspector, gov) = governor(2).await;
        for pid in 1..=4 {
            add_live_agent(&sessions, &inspector, pid, 10).await;
        }

        let killed = gov.enforce_limits().await.unwrap();
        assert_eq!(killed, vec![1, 2]);
        assert_eq!(inspector.signals_for(1), vec![Signal::Kill]);
        assert!(inspector.signals_for(3).is_empty());

        let agents = sessions.agents().await.unwrap();
        let stopped: Vec<_> = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Stopped)
            .filter_map(|a| a.pid)
            .collect();
        assert_eq!(stopped, vec![1, 2]);
        assert!(gov.enforce_limits().await.unwrap().is_empty());
    }
}
