//! Inter-agent conflicts and the operator's options for them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::session::AgentRecord;

/// What the agents are fighting over.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictKind {
    /// Two or more running agents changed the same paths.
    FileConflict { paths: Vec<String> },
    /// Host load above the admission limit with several agents running.
    ResourceContention { load: f64, limit: f64 },
    /// Subtasks that wait on each other.
    DependencyDeadlock { subtasks: Vec<String> },
}

impl ConflictKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FileConflict { .. } => "file_conflict",
            Self::ResourceContention { .. } => "resource_contention",
            Self::DependencyDeadlock { .. } => "dependency_deadlock",
        }
    }
}

/// A detected or reported conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub agents: Vec<AgentRecord>,
}

impl Conflict {
    pub fn deadlock(subtasks: Vec<String>, agents: Vec<AgentRecord>) -> Self {
        Self {
            kind: ConflictKind::DependencyDeadlock { subtasks },
            agents,
        }
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.id.clone()).collect()
    }

    /// Stable identity used to avoid re-alerting the same conflict.
    pub fn signature(&self) -> String {
        let mut ids = self.agent_ids();
        ids.sort();
        format!("{}:{}", self.kind.name(), ids.join(","))
    }

    pub fn summary(&self) -> String {
        let roles: Vec<String> = self
            .agents
            .iter()
            .map(|a| format!("{} ({})", a.role, a.id))
            .collect();
        match &self.kind {
            ConflictKind::FileConflict { paths } => format!(
                "Agents {} changed the same files: {}",
                roles.join(", "),
                paths.join(", ")
            ),
            ConflictKind::ResourceContention { load, limit } => format!(
                "System load {load:.2} exceeds {limit:.2} with {} agents running",
                self.agents.len()
            ),
            ConflictKind::DependencyDeadlock { subtasks } => {
                format!("Subtasks wait on each other: {}", subtasks.join(", "))
            }
        }
    }
}

/// Operator options for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOption {
    /// Suspend every agent involved (SIGSTOP).
    PauseAgents,
    /// Ask for a manual merge of the workspaces.
    ManualMerge,
    /// Restart each agent with a coordination note.
    RestartGroup,
    #[default]
    Ignore,
}

impl ConflictOption {
    pub const ALL: [Self; 4] = [Self::Ignore, Self::PauseAgents, Self::ManualMerge, Self::RestartGroup];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PauseAgents => "pause_agents",
            Self::ManualMerge => "manual_merge",
            Self::RestartGroup => "restart_group",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for ConflictOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|o| o.as_str() == normalized)
            .ok_or_else(|| format!("unknown conflict option: {s}"))
    }
}

/// Group agents that changed the same paths.
///
/// Agents with identical overlap share one conflict listing every shared
/// path.
pub fn detect_file_conflicts(changes: &[(AgentRecord, Vec<String>)]) -> Vec<Conflict> {
    let mut touched: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();
    for (idx, (_, files)) in changes.iter().enumerate() {
        for file in files {
            touched.entry(file.as_str()).or_default().insert(idx);
        }
    }

    let mut groups: BTreeMap<Vec<usize>, Vec<String>> = BTreeMap::new();
    for (path, agents) in touched {
        if agents.len() > 1 {
            groups
                .entry(agents.into_iter().collect())
                .or_default()
                .push(path.to_string());
        }
    }

    groups
        .into_iter()
        .map(|(agents, paths)| Conflict {
            kind: ConflictKind::FileConflict { paths },
            agents: agents.into_iter().map(|i| changes[i].0.clone()).collect(),
        })
        .collect()
}

/// Contention when more than one agent runs on an overloaded host.
pub fn detect_contention(
    agents: &[AgentRecord],
    load: Option<f64>,
    cpus: usize,
    load_factor: f64,
) -> Option<Conflict> {
    let load = load?;
    #[allow(clippy::cast_precision_loss)]
    let limit = cpus as f64 * load_factor;
    (agents.len() > 1 && load >= limit).then(|| Conflict {
        kind: ConflictKind::ResourceContention { load, limit },
        agents: agents.to_vec(),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::orchestration::Role;

    fn agent(role: Role) -> AgentRecord {
        AgentRecord::new(role, "work")
    }

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| (*p).to_string()).collect()
    }

    #[test]
    fn shared_paths_form_one_conflict_per_agent_group() {
        let (a, b, c) = (agent(Role::Backend), agent(Role::Frontend), agent(Role::Qa));
        let conflicts = detect_file_conflicts(&[
            (a.clone(), files(&["src/api.rs", "src/lib.rs", "README.md"])),
            (b.clone(), files(&["src/api.rs", "src/lib.rs"])),
            (c.clone(), files(&["tests/e2e.rs", "README.md"])),
        ]);

        assert_eq!(conflicts.len(), 2);
        let ab = conflicts
            .iter()
            .find(|c| c.agent_ids() == vec![a.id.clone(), b.id.clone()])
            .unwrap();
        assert_eq!(
            ab.kind,
            ConflictKind::FileConflict {
                paths: files(&["src/api.rs", "src/lib.rs"])
            }
        );
        let ac = conflicts
            .iter()
            .find(|x| x.agent_ids() == vec![a.id.clone(), c.id.clone()])
            .unwrap();
        assert_eq!(
            ac.kind,
            ConflictKind::FileConflict {
                paths: files(&["README.md"])
            }
        );
    }

    #[test]
    fn disjoint_changes_do_not_conflict() {
        let conflicts = detect_file_conflicts(&[
            (agent(Role::Backend), files(&["a.rs"])),
            (agent(Role::Frontend), files(&["b.tsx"])),
            (agent(Role::Qa), Vec::new()),
        ]);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn contention_needs_load_and_several_agents() {
        let two = vec![agent(Role::Backend), agent(Role::Qa)];
        let conflict = detect_contention(&two, Some(6.5), 4, 1.5).unwrap();
        assert!(matches!(conflict.kind, ConflictKind::ResourceContention { limit, .. } if (limit - 6.0).abs() < f64::EPSILON));

        assert!(detect_contention(&two, Some(5.9), 4, 1.5).is_none());
        assert!(detect_contention(&two[..1], Some(50.0), 4, 1.5).is_none());
        assert!(detect_contention(&two, None, 4, 1.5).is_none());
    }

    #[test]
    fn signature_ignores_agent_order() {
        let (a, b) = (agent(Role::Backend), agent(Role::Qa));
        let one = Conflict::deadlock(vec!["x".into()], vec![a.clone(), b.clone()]);
        let two = Conflict::deadlock(vec!["x".into()], vec![b, a]);
        assert_eq!(one.signature(), two.signature());
        assert!(one.summary().contains("x"));
    }

    #[test]
    fn option_parsing() {
        assert_eq!("pause-agents".parse::<ConflictOption>(), Ok(ConflictOption::PauseAgents));
        assert_eq!("IGNORE".parse::<ConflictOption>(), Ok(ConflictOption::Ignore));
        assert!("merge".parse::<ConflictOption>().is_err());
        assert_eq!(ConflictOption::default(), ConflictOption::Ignore);
    }
}
