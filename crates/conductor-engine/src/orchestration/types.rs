//! Plan-level types shared by the decomposer, scheduler and supervisor.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Role a worker plays for one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Backend,
    Frontend,
    Qa,
    Ux,
    General,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Qa => "qa",
            Self::Ux => "ux",
            Self::General => "general",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            "qa" => Ok(Self::Qa),
            "ux" => Ok(Self::Ux),
            "general" => Ok(Self::General),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Classification of a task description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FullFeature,
    BackendFocused,
    FrontendFocused,
    Infrastructure,
    General,
}

impl TaskType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullFeature => "full_feature",
            Self::BackendFocused => "backend_focused",
            Self::FrontendFocused => "frontend_focused",
            Self::Infrastructure => "infrastructure",
            Self::General => "general",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role-specific hints carried into the worker prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleContext {
    pub responsibilities: Vec<String>,
    pub best_practices: Vec<String>,
    pub coordination_note: String,
}

/// One role-scoped unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub role: Role,
    pub description: String,
    pub dependencies: BTreeSet<String>,
    pub priority: i32,
    pub context: RoleContext,
}

impl Subtask {
    /// Create a subtask with no dependencies and an empty context.
    pub fn new(id: impl Into<String>, role: Role, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            description: description.into(),
            dependencies: BTreeSet::new(),
            priority: 0,
            context: RoleContext::default(),
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: RoleContext) -> Self {
        self.context = context;
        self
    }
}

/// Project metadata handed to the decomposer and the worker prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Free-form project kind, e.g. `"generic"` or `"rust"`.
    pub project_type: String,
    pub root: PathBuf,
    pub name: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ProjectContext {
    pub fn new(project_type: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            project_type: project_type.into(),
            root: root.into(),
            name: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Display name: explicit name, else the root directory name.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.root
                .file_name()
                .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned())
        })
    }
}

/// A set of subtasks that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub index: usize,
    pub subtasks: Vec<Subtask>,
}

impl Phase {
    pub fn ids(&self) -> Vec<String> {
        self.subtasks.iter().map(|s| s.id.clone()).collect()
    }
}

/// Ordered phases plus whatever could not be scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub task_type: Option<TaskType>,
    pub phases: Vec<Phase>,
    /// Subtasks left over because their dependencies can never be satisfied.
    pub unscheduled: Vec<Subtask>,
}

impl ExecutionPlan {
    pub fn subtask_count(&self) -> usize {
        self.phases.iter().map(|p| p.subtasks.len()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.unscheduled.is_empty()
    }

    /// Index of the phase holding `id`, if it was scheduled.
    pub fn phase_of(&self, id: &str) -> Option<usize> {
        self.phases
            .iter()
            .find(|p| p.subtasks.iter().any(|s| s.id == id))
            .map(|p| p.index)
    }

    pub fn unscheduled_ids(&self) -> Vec<String> {
        self.unscheduled.iter().map(|s| s.id.clone()).collect()
    }

    /// `CycleDetected` for the remainder, if scheduling was truncated.
    pub fn remainder_error(&self) -> Option<EngineError> {
        if self.unscheduled.is_empty() {
            None
        } else {
            Some(EngineError::CycleDetected {
                remaining: self.unscheduled_ids(),
            })
        }
    }
}

/// Why one subtask did not produce a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSubtask {
    pub id: String,
    pub reason: String,
}

/// Outcome of one executed phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub index: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedSubtask>,
}

impl PhaseReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of `PhaseScheduler::execute`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    pub phases: Vec<PhaseReport>,
    /// Subtasks in phases that were never started after a failure.
    pub not_started: Vec<String>,
    /// Remainder that could not be scheduled because of a cycle.
    pub unscheduled: Vec<String>,
}

impl PlanResult {
    pub fn succeeded(&self) -> Vec<String> {
        self.phases
            .iter()
            .flat_map(|p| p.succeeded.iter().cloned())
            .collect()
    }

    pub fn failed(&self) -> Vec<String> {
        self.phases
            .iter()
            .flat_map(|p| p.failed.iter().map(|f| f.id.clone()))
            .collect()
    }

    /// Every scheduled subtask started and none failed.
    pub fn is_success(&self) -> bool {
        self.not_started.is_empty() && self.phases.iter().all(PhaseReport::is_success)
    }
}
