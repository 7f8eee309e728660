//! Engine error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

use crate::workspace::WorkspaceError;

/// Result type alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Admission denied: {}", reasons.join("; "))]
    AdmissionDenied { reasons: Vec<String> },

    #[error("Workspace creation failed: {reason}")]
    WorkspaceCreationFailed { reason: String },

    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Process not found: {pid}")]
    ProcessNotFound { pid: u32 },

    #[error("No operator decision for request {request_id}")]
    DecisionTimeout { request_id: String },

    #[error("Dependency cycle among subtasks: {}", remaining.join(", "))]
    CycleDetected { remaining: Vec<String> },

    #[error("Session document {} is corrupt: {reason}", path.display())]
    SessionCorrupt { path: PathBuf, reason: String },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Configuration error: {0}")]
    Config(#[from] conductor_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
