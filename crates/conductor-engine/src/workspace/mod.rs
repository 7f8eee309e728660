//! Isolated per-agent workspaces.
//!
//! The engine only talks to [`WorkspaceBackend`]; [`GitWorktreeBackend`] is
//! the default implementation (one branch + worktree per agent).

mod git;
#[cfg(any(test, feature = "test-utils"))]
mod fake;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeWorkspaceBackend;
pub use git::GitWorktreeBackend;

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Not a repository: {0}")]
    NotARepository(String),

    #[error("Workspace path already exists: {0}")]
    PathExists(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A created workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub key: String,
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Capability for creating and releasing isolated workspaces.
#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    /// Create a fresh isolated workspace identified by `key`.
    async fn create_workspace(&self, key: &str) -> Result<Workspace, WorkspaceError>;

    /// Release a workspace. Removing an already-missing path succeeds.
    async fn remove_workspace(&self, path: &Path) -> Result<(), WorkspaceError>;

    /// Delete the branch backing a workspace. Missing branches succeed.
    async fn delete_branch(&self, branch: &str) -> Result<(), WorkspaceError>;

    /// Paths modified in the workspace relative to its root.
    async fn changed_files(&self, path: &Path) -> Result<Vec<String>, WorkspaceError>;

    /// Directory all workspaces are created under.
    fn base_dir(&self) -> &Path;

    /// Workspace directories currently on disk.
    async fn list_workspaces(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        let base = self.base_dir();
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(base).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// Validate a workspace key or branch name: alphanumerics plus `-_./`.
/// Rejects path traversal (`..`), leading dashes, and control characters.
pub(crate) fn validate_name(name: &str) -> Result<(), WorkspaceError> {
    if name.is_empty() {
        return Err(WorkspaceError::InvalidName("name cannot be empty".into()));
    }
    if name.starts_with('-') {
        return Err(WorkspaceError::InvalidName(
            "name cannot start with a dash".into(),
        ));
    }
    if name.contains("..") {
        return Err(WorkspaceError::InvalidName(
            "name cannot contain '..'".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(WorkspaceError::InvalidName(format!(
            "name contains invalid characters: {name}"
        )));
    }
    Ok(())
}
