//! Plan types, the phase scheduler and the retry policy it uses.
//!
//! - [`PhaseScheduler`]: groups a subtask DAG into phases and executes them
//!   through a [`SubtaskLauncher`], fail-fast per phase.
//! - [`RetryPolicy`]: exponential backoff with jitter, reused wherever an
//!   operation may be retried.

pub mod retry;
pub mod scheduler;
mod types;

pub use retry::RetryPolicy;
pub use scheduler::{PhaseScheduler, Stagger, SubtaskLauncher};
pub use types::{
    ExecutionPlan, FailedSubtask, Phase, PhaseReport, PlanResult, ProjectContext, Role,
    RoleContext, Subtask, TaskType,
};
