//! Phase scheduler: breadth-first leveling of the subtask DAG and
//! phase-by-phase execution.
//!
//! [`PhaseScheduler::plan`] repeatedly takes every subtask whose dependencies
//! are all in earlier phases as the next phase, so each phase is as wide as
//! the graph allows. A cycle (or a dependency on an unknown id) stops the
//! leveling; the phases computed so far stay valid and the rest is reported
//! as the unscheduled remainder.
//!
//! [`PhaseScheduler::execute`] spawns each phase concurrently and waits only
//! for the spawn calls, never for the workers themselves.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::types::{ExecutionPlan, FailedSubtask, Phase, PhaseReport, PlanResult, Subtask};
use crate::supervisor::SpawnOutcome;

/// Anything that can turn a subtask into a worker.
#[async_trait]
pub trait SubtaskLauncher: Send + Sync {
    /// Admission-checked spawn.
    async fn spawn(&self, subtask: &Subtask) -> SpawnOutcome;

    /// Synchronous execution without admission control.
    async fn run_direct(&self, subtask: &Subtask) -> SpawnOutcome;
}

/// Randomized spacing between launches within one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stagger {
    pub min: Duration,
    pub max: Duration,
}

impl Stagger {
    pub const NONE: Self = Self {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Start offsets for `n` launches: the first starts at once, each later
    /// one a random `min..=max` after its predecessor.
    pub fn offsets(&self, n: usize) -> Vec<Duration> {
        let lo = u64::try_from(self.min.as_millis()).unwrap_or(u64::MAX);
        let hi = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX).max(lo);
        let mut rng = rand::rng();
        let mut at = Duration::ZERO;
        (0..n)
            .map(|i| {
                if i > 0 && hi > 0 {
                    at += Duration::from_millis(rng.random_range(lo..=hi));
                }
                at
            })
            .collect()
    }
}

/// Drives an [`ExecutionPlan`] through a [`SubtaskLauncher`].
pub struct PhaseScheduler {
    launcher: Arc<dyn SubtaskLauncher>,
    retry: RetryPolicy,
    stagger: Stagger,
    phase_pause: Duration,
}

impl PhaseScheduler {
    pub fn new(launcher: Arc<dyn SubtaskLauncher>) -> Self {
        Self {
            launcher,
            retry: RetryPolicy::default(),
            stagger: Stagger::new(Duration::from_secs(1), Duration::from_secs(3)),
            phase_pause: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_stagger(mut self, stagger: Stagger) -> Self {
        self.stagger = stagger;
        self
    }

    #[must_use]
    pub const fn with_phase_pause(mut self, pause: Duration) -> Self {
        self.phase_pause = pause;
        self
    }

    /// Group subtasks into dependency-respecting phases.
    ///
    /// Within a phase, subtasks are ordered by descending priority, then id.
    pub fn plan(subtasks: Vec<Subtask>) -> ExecutionPlan {
        let known: HashSet<String> = subtasks.iter().map(|s| s.id.clone()).collect();
        for subtask in &subtasks {
            for dep in subtask.dependencies.iter().filter(|d| !known.contains(*d)) {
                warn!(subtask = %subtask.id, dependency = %dep, "Subtask depends on unknown id");
            }
        }

        let mut remaining = subtasks;
        let mut emitted: BTreeSet<String> = BTreeSet::new();
        let mut phases: Vec<Phase> = Vec::new();

        while !remaining.is_empty() {
            let (mut ready, blocked): (Vec<Subtask>, Vec<Subtask>) = remaining
                .into_iter()
                .partition(|s| s.dependencies.iter().all(|d| emitted.contains(d)));

            if ready.is_empty() {
                let ids: Vec<&str> = blocked.iter().map(|s| s.id.as_str()).collect();
                warn!(remaining = ?ids, "Dependency cycle, truncating plan");
                return ExecutionPlan {
                    task_type: None,
                    phases,
                    unscheduled: blocked,
                };
            }

            ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
            emitted.extend(ready.iter().map(|s| s.id.clone()));
            phases.push(Phase {
                index: phases.len(),
                subtasks: ready,
            });
            remaining = blocked;
        }

        ExecutionPlan {
            task_type: None,
            phases,
            unscheduled: Vec::new(),
        }
    }

    /// Execute phases in order, stopping after the first failed phase.
    pub async fn execute(&self, plan: &ExecutionPlan) -> PlanResult {
        let mut result = PlanResult {
            unscheduled: plan.unscheduled_ids(),
            ..PlanResult::default()
        };
        if !result.unscheduled.is_empty() {
            warn!(
                unscheduled = ?result.unscheduled,
                "Executing truncated plan; unscheduled subtasks will not run"
            );
        }

        for (i, phase) in plan.phases.iter().enumerate() {
            if i > 0 && !self.phase_pause.is_zero() {
                tokio::time::sleep(self.phase_pause).await;
            }

            info!(phase = phase.index, subtasks = ?phase.ids(), "Starting phase");
            let report = self.run_phase(phase).await;
            let ok = report.is_success();
            result.phases.push(report);

            if !ok {
                result.not_started = plan.phases[i + 1..]
                    .iter()
                    .flat_map(Phase::ids)
                    .collect();
                error!(
                    phase = phase.index,
                    failed = ?result.phases.last().map(|p| p.failed.iter().map(|f| f.id.as_str()).collect::<Vec<_>>()),
                    not_started = ?result.not_started,
                    "Phase failed, stopping execution"
                );
                break;
            }
        }

        info!(
            succeeded = result.succeeded().len(),
            failed = result.failed().len(),
            not_started = result.not_started.len(),
            "Plan execution finished"
        );
        result
    }

    async fn run_phase(&self, phase: &Phase) -> PhaseReport {
        let offsets = self.stagger.offsets(phase.subtasks.len());
        let mut set = JoinSet::new();

        for (subtask, offset) in phase.subtasks.iter().cloned().zip(offsets) {
            let launcher = Arc::clone(&self.launcher);
            let retry = self.retry;
            set.spawn(async move {
                if !offset.is_zero() {
                    tokio::time::sleep(offset).await;
                }
                let outcome = spawn_with_fallback(launcher.as_ref(), &subtask, retry).await;
                (subtask.id, outcome)
            });
        }

        let mut outcomes: HashMap<String, SpawnOutcome> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    outcomes.insert(id, outcome);
                }
                Err(e) => error!(error = %e, "Spawn task aborted"),
            }
        }

        let mut report = PhaseReport {
            index: phase.index,
            ..PhaseReport::default()
        };
        for subtask in &phase.subtasks {
            match outcomes.remove(&subtask.id) {
                Some(outcome) if outcome.is_success() => report.succeeded.push(subtask.id.clone()),
                Some(outcome) => report.failed.push(FailedSubtask {
                    id: subtask.id.clone(),
                    reason: outcome.failure_reason(),
                }),
                None => report.failed.push(FailedSubtask {
                    id: subtask.id.clone(),
                    reason: "spawn task aborted".to_string(),
                }),
            }
        }
        report
    }
}

/// Spawn, retrying admission denials, then fall back to direct execution.
async fn spawn_with_fallback(
    launcher: &dyn SubtaskLauncher,
    subtask: &Subtask,
    retry: RetryPolicy,
) -> SpawnOutcome {
    let attempt = retry
        .retry(|attempt| async move {
            match launcher.spawn(subtask).await {
                SpawnOutcome::Denied { reasons } => {
                    debug!(subtask = %subtask.id, attempt, ?reasons, "Spawn denied");
                    Err(reasons)
                }
                other => Ok(other),
            }
        })
        .await;

    match attempt {
        Ok(outcome) => outcome,
        Err(reasons) => {
            warn!(
                subtask = %subtask.id,
                ?reasons,
                "Admission still denied after retries, executing directly"
            );
            launcher.run_direct(subtask).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::orchestration::Role;
    use crate::session::AgentRecord;
    use std::sync::Mutex;

    fn task(id: &str, deps: &[&str]) -> Subtask {
        Subtask::new(id, Role::General, format!("do {id}")).depends_on(deps.iter().copied())
    }

    fn phase_ids(plan: &ExecutionPlan) -> Vec<Vec<String>> {
        plan.phases.iter().map(Phase::ids).collect()
    }

    /// Scripted launcher: outcomes per subtask id, spawned otherwise.
    #[derive(Default)]
    struct ScriptedLauncher {
        fail: HashSet<String>,
        deny_times: Mutex<HashMap<String, usize>>,
        direct_fails: bool,
        calls: Mutex<Vec<String>>,
        direct_calls: Mutex<Vec<String>>,
    }

    impl ScriptedLauncher {
        fn failing(ids: &[&str]) -> Self {
            Self {
                fail: ids.iter().map(|s| (*s).to_string()).collect(),
                ..Self::default()
            }
        }

        fn denying(id: &str, times: usize) -> Self {
            let launcher = Self::default();
            launcher.deny_times.lock().unwrap().insert(id.to_string(), times);
            launcher
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SubtaskLauncher for ScriptedLauncher {
        async fn spawn(&self, subtask: &Subtask) -> SpawnOutcome {
            self.calls.lock().unwrap().push(subtask.id.clone());
            {
                let mut deny = self.deny_times.lock().unwrap();
                if let Some(left) = deny.get_mut(&subtask.id)
                    && *left > 0
                {
                    *left -= 1;
                    return SpawnOutcome::Denied {
                        reasons: vec!["concurrency limit reached".into()],
                    };
                }
            }
            if self.fail.contains(&subtask.id) {
                return SpawnOutcome::Failed {
                    reason: "workspace creation failed".into(),
                };
            }
            let mut record = AgentRecord::new(subtask.role, &subtask.description);
            record.pid = Some(1000);
            SpawnOutcome::Spawned(record)
        }

        async fn run_direct(&self, subtask: &Subtask) -> SpawnOutcome {
            self.direct_calls.lock().unwrap().push(subtask.id.clone());
            let mut record = AgentRecord::new(subtask.role, &subtask.description);
            record.executed_directly = true;
            SpawnOutcome::ExecutedDirectly {
                record,
                success: !self.direct_fails,
            }
        }
    }

    fn scheduler(launcher: Arc<ScriptedLauncher>) -> PhaseScheduler {
        PhaseScheduler::new(launcher)
            .with_stagger(Stagger::NONE)
            .with_phase_pause(Duration::ZERO)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10), Duration::ZERO))
    }

    // =========================================================================
    // Planning
    // =========================================================================

    #[test]
    fn independent_subtasks_share_a_phase() {
        let plan = PhaseScheduler::plan(vec![task("a", &[]), task("b", &[]), task("c", &["a", "b"])]);
        assert_eq!(phase_ids(&plan), vec![vec!["a", "b"], vec!["c"]]);
        assert!(plan.is_complete());
    }

    #[test]
    fn diamond_levels_breadth_first() {
        let plan = PhaseScheduler::plan(vec![
            task("d", &["b", "c"]),
            task("c", &["a"]),
            task("b", &["a"]),
            task("a", &[]),
        ]);
        assert_eq!(phase_ids(&plan), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn priority_orders_within_phase() {
        let plan = PhaseScheduler::plan(vec![
            task("low", &[]).with_priority(1),
            task("high", &[]).with_priority(9),
            task("mid", &[]).with_priority(5),
        ]);
        assert_eq!(phase_ids(&plan), vec![vec!["high", "mid", "low"]]);
    }

    #[test]
    fn every_dependency_lies_in_an_earlier_phase() {
        // Layered graph: node i depends on every node below i with i % j == 0.
        let subtasks: Vec<Subtask> = (1..=24)
            .map(|i| {
                let deps: Vec<String> = (1..i).filter(|j| i % j == 0).map(|j| format!("n{j}")).collect();
                Subtask::new(format!("n{i}"), Role::General, "x").depends_on(deps)
            })
            .collect();
        let plan = PhaseScheduler::plan(subtasks.clone());

        assert!(plan.is_complete());
        assert_eq!(plan.subtask_count(), subtasks.len());
        for s in &subtasks {
            let own = plan.phase_of(&s.id).unwrap();
            for d in &s.dependencies {
                assert!(plan.phase_of(d).unwrap() < own, "{d} must precede {}", s.id);
            }
        }
        let mut seen = HashSet::new();
        for p in &plan.phases {
            for s in &p.subtasks {
                assert!(seen.insert(s.id.clone()), "{} scheduled twice", s.id);
            }
        }
    }

    #[test]
    fn cycle_truncates_but_keeps_prefix() {
        let plan = PhaseScheduler::plan(vec![
            task("root", &[]),
            task("x", &["root", "z"]),
            task("y", &["x"]),
            task("z", &["y"]),
        ]);

        assert_eq!(phase_ids(&plan), vec![vec!["root"]]);
        let mut rest = plan.unscheduled_ids();
        rest.sort();
        assert_eq!(rest, vec!["x", "y", "z"]);
        match plan.remainder_error() {
            Some(crate::error::EngineError::CycleDetected { remaining }) => assert_eq!(remaining.len(), 3),
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = PhaseScheduler::plan(vec![task("a", &["a"])]);
        assert!(plan.phases.is_empty());
        assert_eq!(plan.unscheduled_ids(), vec!["a"]);
    }

    #[test]
    fn unknown_dependency_is_unscheduled() {
        let plan = PhaseScheduler::plan(vec![task("a", &[]), task("b", &["ghost"])]);
        assert_eq!(phase_ids(&plan), vec![vec!["a"]]);
        assert_eq!(plan.unscheduled_ids(), vec!["b"]);
    }

    #[test]
    fn empty_input_is_empty_plan() {
        let plan = PhaseScheduler::plan(Vec::new());
        assert!(plan.phases.is_empty());
        assert!(plan.remainder_error().is_none());
    }

    #[test]
    fn stagger_offsets_are_cumulative_and_bounded() {
        let stagger = Stagger::new(Duration::from_millis(100), Duration::from_millis(300));
        let offsets = stagger.offsets(4);
        assert_eq!(offsets[0], Duration::ZERO);
        for pair in offsets.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(100) && gap <= Duration::from_millis(300));
        }
        assert!(Stagger::NONE.offsets(3).iter().all(Duration::is_zero));
    }

    // =========================================================================
    // Execution
    // =========================================================================

    #[tokio::test]
    async fn executes_all_phases_in_order() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let plan = PhaseScheduler::plan(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])]);

        let result = scheduler(Arc::clone(&launcher)).execute(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.succeeded(), vec!["a", "b", "c"]);
        assert_eq!(launcher.calls(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_phase_stops_later_phases() {
        let launcher = Arc::new(ScriptedLauncher::failing(&["b"]));
        let plan = PhaseScheduler::plan(vec![
            task("a", &[]),
            task("b", &[]),
            task("c", &["a", "b"]),
            task("d", &["c"]),
        ]);

        let result = scheduler(Arc::clone(&launcher)).execute(&plan).await;

        assert!(!result.is_success());
        assert_eq!(result.succeeded(), vec!["a"]);
        assert_eq!(result.failed(), vec!["b"]);
        assert_eq!(result.phases[0].failed[0].reason, "workspace creation failed");
        assert_eq!(result.not_started, vec!["c", "d"]);
        assert!(!launcher.calls().contains(&"c".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_denial_is_retried() {
        let launcher = Arc::new(ScriptedLauncher::denying("a", 2));
        let plan = PhaseScheduler::plan(vec![task("a", &[])]);

        let result = scheduler(Arc::clone(&launcher)).execute(&plan).await;

        assert!(result.is_success());
        assert_eq!(launcher.calls().len(), 3);
        assert!(launcher.direct_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_denial_falls_back_to_direct_execution() {
        let launcher = Arc::new(ScriptedLauncher::denying("a", usize::MAX));
        let plan = PhaseScheduler::plan(vec![task("a", &[]), task("b", &["a"])]);

        let result = scheduler(Arc::clone(&launcher)).execute(&plan).await;

        assert!(result.is_success());
        assert_eq!(*launcher.direct_calls.lock().unwrap(), vec!["a"]);
        assert_eq!(result.succeeded(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_direct_fallback_fails_the_phase() {
        let launcher = Arc::new(ScriptedLauncher {
            direct_fails: true,
            ..ScriptedLauncher::denying("a", usize::MAX)
        });
        let plan = PhaseScheduler::plan(vec![task("a", &[])]);

        let result = scheduler(launcher).execute(&plan).await;
        assert_eq!(result.failed(), vec!["a"]);
    }

    #[tokio::test]
    async fn truncated_plan_still_runs_prefix() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let plan = PhaseScheduler::plan(vec![task("ok", &[]), task("x", &["y"]), task("y", &["x"])]);

        let result = scheduler(Arc::clone(&launcher)).execute(&plan).await;

        assert_eq!(result.succeeded(), vec!["ok"]);
        let mut unscheduled = result.unscheduled.clone();
        unscheduled.sort();
        assert_eq!(unscheduled, vec!["x", "y"]);
        assert_eq!(launcher.calls(), vec!["ok"]);
    }
}
