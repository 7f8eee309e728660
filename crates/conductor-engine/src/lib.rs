//! Conductor Engine Library
//!
//! Multi-agent orchestration for coding tasks:
//! - Task decomposition into a role-tagged subtask DAG
//! - Phase scheduling with admission retries and direct-execution fallback
//! - Worker supervision in isolated git worktrees
//! - Durable session registry with crash reconciliation
//! - Health monitoring with operator-gated recovery
//! - Bounded cleanup of workspaces, branches and temp files

pub mod cleanup;
pub mod console;
pub mod decompose;
pub mod error;
pub mod health;
pub mod orchestration;
pub mod orchestrator;
pub mod process;
pub mod resources;
pub mod session;
pub mod supervisor;
pub mod workspace;

#[cfg(test)]
#[allow(clippy::expect_used)]
mod testing;

pub use error::{EngineError, Result};
pub use orchestrator::{Backends, Orchestrator, RunReport, StatusReport};
