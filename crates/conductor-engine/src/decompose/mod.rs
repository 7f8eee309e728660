//! Task decomposition: classify a natural-language task and expand it into a
//! dependency graph of role-tagged subtasks.
//!
//! Classification is keyword based. A description that mentions both UI and
//! data/API vocabulary is a full feature; otherwise infrastructure wins over
//! backend, which wins over frontend.

mod templates;

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::orchestration::{ExecutionPlan, PhaseScheduler, ProjectContext, Subtask, TaskType};

static UI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ui|ux|frontend|front-end|interface|page|pages|component|components|form|forms|button|buttons|view|views|screen|screens|dashboard|layout|css|style|styles|styling|react|vue|svelte|angular|html|modal|widget)\b",
    )
    .expect("static regex is valid")
});

static API_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(api|apis|endpoint|endpoints|backend|back-end|server|database|db|schema|model|models|rest|graphql|query|queries|auth|authentication|login|service|services|sql|migration|migrations|crud)\b",
    )
    .expect("static regex is valid")
});

static INFRA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(deploy|deployment|docker|dockerfile|container|containers|kubernetes|k8s|helm|terraform|ci|cd|pipeline|pipelines|infrastructure|infra|nginx|monitoring|provision|provisioning|ansible|cloud|aws|gcp|azure)\b",
    )
    .expect("static regex is valid")
});

/// Classify a task description.
pub fn classify(description: &str) -> TaskType {
    let ui = UI_RE.is_match(description);
    let api = API_RE.is_match(description);
    let infra = INFRA_RE.is_match(description);

    let task_type = if ui && api {
        TaskType::FullFeature
    } else if infra {
        TaskType::Infrastructure
    } else if api {
        TaskType::BackendFocused
    } else if ui {
        TaskType::FrontendFocused
    } else {
        TaskType::General
    };
    debug!(ui, api, infra, %task_type, "Classified task");
    task_type
}

/// Stateless decomposer over the built-in template table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskDecomposer;

impl TaskDecomposer {
    pub const fn new() -> Self {
        Self
    }

    /// Subtask DAG for `description`, without scheduling.
    pub fn subtasks(&self, description: &str, project: &ProjectContext) -> Vec<Subtask> {
        let task_type = classify(description);
        let mut subtasks = templates::instantiate(task_type, description.trim());
        for subtask in &mut subtasks {
            subtask.context.coordination_note = format!(
                "{} Project: {} ({}).",
                subtask.context.coordination_note,
                project.display_name(),
                project.project_type
            );
        }
        subtasks
    }

    /// Classify, expand and schedule `description` into phases.
    pub fn decompose(&self, description: &str, project: &ProjectContext) -> ExecutionPlan {
        let mut plan = PhaseScheduler::plan(self.subtasks(description, project));
        plan.task_type = Some(classify(description));
        plan
    }
}
