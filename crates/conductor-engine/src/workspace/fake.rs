use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Workspace, WorkspaceBackend, WorkspaceError};

#[derive(Debug, Default)]
struct FakeState {
    fail_create: bool,
    remove_delay: Option<Duration>,
    created: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    deleted_branches: Vec<String>,
    changes: HashMap<PathBuf, Vec<String>>,
}

/// Plain-directory workspaces for tests.
#[derive(Debug)]
pub struct FakeWorkspaceBackend {
    base_dir: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeWorkspaceBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Make `remove_workspace` sleep first.
    pub fn set_remove_delay(&self, delay: Duration) {
        self.lock().remove_delay = Some(delay);
    }

    pub fn set_changed_files(&self, path: &Path, files: &[&str]) {
        self.lock()
            .changes
            .insert(path.to_path_buf(), files.iter().map(|f| (*f).to_string()).collect());
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.lock().removed.clone()
    }

    pub fn deleted_branches(&self) -> Vec<String> {
        self.lock().deleted_branches.clone()
    }
}

#[async_trait]
impl WorkspaceBackend for FakeWorkspaceBackend {
    async fn create_workspace(&self, key: &str) -> Result<Workspace, WorkspaceError> {
        if self.lock().fail_create {
            return Err(WorkspaceError::Git("simulated worktree failure".to_string()));
        }
        let path = self.base_dir.join(key);
        if path.exists() {
            return Err(WorkspaceError::PathExists(path.display().to_string()));
        }
        std::fs::create_dir_all(&path)?;
        self.lock().created.push(path.clone());
        Ok(Workspace {
            key: key.to_string(),
            path,
            branch: Some(format!("conductor/{key}")),
        })
    }

    async fn remove_workspace(&self, path: &Path) -> Result<(), WorkspaceError> {
        let delay = self.lock().remove_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        self.lock().removed.push(path.to_path_buf());
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), WorkspaceError> {
        self.lock().deleted_branches.push(branch.to_string());
        Ok(())
    }

    async fn changed_files(&self, path: &Path) -> Result<Vec<String>, WorkspaceError> {
        Ok(self.lock().changes.get(path).cloned().unwrap_or_default())
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
