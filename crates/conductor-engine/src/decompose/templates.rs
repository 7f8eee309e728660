//! Subtask templates per task classification, and role context bundles.

use crate::orchestration::{Role, RoleContext, Subtask, TaskType};

struct Slot {
    id: &'static str,
    role: Role,
    deps: &'static [&'static str],
    description: &'static str,
}

const FULL_FEATURE: &[Slot] = &[
    Slot {
        id: "backend",
        role: Role::Backend,
        deps: &[],
        description: "Implement the server-side logic, data model and API for",
    },
    Slot {
        id: "frontend",
        role: Role::Frontend,
        deps: &["backend"],
        description: "Build the user interface on top of the new API for",
    },
    Slot {
        id: "qa",
        role: Role::Qa,
        deps: &["backend", "frontend"],
        description: "Write and run tests covering API and UI for",
    },
    Slot {
        id: "integration",
        role: Role::General,
        deps: &["qa"],
        description: "Integrate the pieces, fix loose ends and document",
    },
];

const BACKEND_FOCUSED: &[Slot] = &[
    Slot {
        id: "backend",
        role: Role::Backend,
        deps: &[],
        description: "Implement",
    },
    Slot {
        id: "qa",
        role: Role::Qa,
        deps: &["backend"],
        description: "Test the backend changes for",
    },
];

const FRONTEND_FOCUSED: &[Slot] = &[
    Slot {
        id: "ux",
        role: Role::Ux,
        deps: &[],
        description: "Design the interaction flow and layout for",
    },
    Slot {
        id: "frontend",
        role: Role::Frontend,
        deps: &["ux"],
        description: "Implement the interface for",
    },
    Slot {
        id: "qa",
        role: Role::Qa,
        deps: &["frontend"],
        description: "Test the interface changes for",
    },
];

const INFRASTRUCTURE: &[Slot] = &[
    Slot {
        id: "infrastructure",
        role: Role::General,
        deps: &[],
        description: "Set up the infrastructure for",
    },
    Slot {
        id: "qa",
        role: Role::Qa,
        deps: &["infrastructure"],
        description: "Validate the infrastructure changes for",
    },
];

const GENERAL: &[Slot] = &[Slot {
    id: "general",
    role: Role::General,
    deps: &[],
    description: "Complete",
}];

const fn slots(task_type: TaskType) -> &'static [Slot] {
    match task_type {
        TaskType::FullFeature => FULL_FEATURE,
        TaskType::BackendFocused => BACKEND_FOCUSED,
        TaskType::FrontendFocused => FRONTEND_FOCUSED,
        TaskType::Infrastructure => INFRASTRUCTURE,
        TaskType::General => GENERAL,
    }
}

/// Instantiate the template for `task_type`.
///
/// Earlier slots get higher priority so they sort first within a phase.
pub(super) fn instantiate(task_type: TaskType, description: &str) -> Vec<Subtask> {
    let template = slots(task_type);
    let count = i32::try_from(template.len()).unwrap_or(i32::MAX);
    template
        .iter()
        .zip(0..)
        .map(|(slot, idx)| {
            let dependents: Vec<&str> = template
                .iter()
                .filter(|other| other.deps.contains(&slot.id))
                .map(|other| other.id)
                .collect();
            Subtask::new(slot.id, slot.role, format!("{} {description}", slot.description))
                .depends_on(slot.deps.iter().copied())
                .with_priority(count - idx)
                .with_context(role_context(slot.role, slot.deps, &dependents))
        })
        .collect()
}

fn role_context(role: Role, deps: &[&str], dependents: &[&str]) -> RoleContext {
    let (responsibilities, best_practices) = bundle(role);
    RoleContext {
        responsibilities: responsibilities.iter().map(|s| (*s).to_string()).collect(),
        best_practices: best_practices.iter().map(|s| (*s).to_string()).collect(),
        coordination_note: coordination_note(deps, dependents),
    }
}

fn coordination_note(deps: &[&str], dependents: &[&str]) -> String {
    match (deps.is_empty(), dependents.is_empty()) {
        (true, true) => "You are the only agent on this task.".to_string(),
        (true, false) => format!(
            "You go first. {} will build on your work, so keep interfaces stable and commit early.",
            dependents.join(", ")
        ),
        (false, true) => format!(
            "Work from the results of {}. You finish the task.",
            deps.join(", ")
        ),
        (false, false) => format!(
            "Work from the results of {}. {} will build on your work.",
            deps.join(", "),
            dependents.join(", ")
        ),
    }
}

const fn bundle(role: Role) -> (&'static [&'static str], &'static [&'static str]) {
    match role {
        Role::Backend => (
            &[
                "Design and implement APIs and business logic",
                "Own data models, schemas and migrations",
                "Handle authentication, validation and error responses",
            ],
            &[
                "Keep endpoints consistent and documented",
                "Validate all input at the boundary",
                "Add unit tests next to new logic",
            ],
        ),
        Role::Frontend => (
            &[
                "Build components, pages and client-side state",
                "Wire the UI to backend APIs",
                "Handle loading and error states",
            ],
            &[
                "Reuse existing components and styles",
                "Keep components small and accessible",
                "Do not change backend contracts",
            ],
        ),
        Role::Qa => (
            &[
                "Write integration and end-to-end tests",
                "Run the existing test suite and report regressions",
                "Check edge cases and error paths",
            ],
            &[
                "Prefer deterministic tests",
                "Report failures with reproduction steps",
                "Do not rewrite production code beyond small fixes",
            ],
        ),
        Role::Ux => (
            &[
                "Define user flows and screen layout",
                "Specify component states and copy",
            ],
            &[
                "Follow the existing design language",
                "Write the design down where frontend can read it",
            ],
        ),
        Role::General => (
            &[
                "Carry out the task end to end",
                "Keep the repository building and tests passing",
            ],
            &[
                "Make small, reviewable commits",
                "Document anything non-obvious",
            ],
        ),
    }
}
