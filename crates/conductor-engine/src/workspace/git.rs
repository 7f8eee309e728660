//! Git worktree backend: one branch and worktree per agent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Workspace, WorkspaceBackend, WorkspaceError, validate_name};

/// Branch namespace for agent workspaces.
const BRANCH_PREFIX: &str = "conductor";

/// Identity used for the synthesized initial commit, so repositories without
/// a configured user still work.
const COMMIT_IDENTITY: [&str; 4] = [
    "-c",
    "user.name=conductor",
    "-c",
    "user.email=conductor@localhost",
];

/// Creates workspaces as `git worktree`s of `repo_root` under `base_dir`.
#[derive(Debug)]
pub struct GitWorktreeBackend {
    repo_root: PathBuf,
    base_dir: PathBuf,
    // Serializes the initial-commit check across concurrent spawns.
    init_lock: Mutex<()>,
}

impl GitWorktreeBackend {
    pub fn new(repo_root: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            base_dir: base_dir.into(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Branch name used for workspace `key`.
    pub fn branch_for(key: &str) -> String {
        format!("{BRANCH_PREFIX}/{key}")
    }

    /// Make sure `HEAD` exists, committing an empty root commit if needed.
    ///
    /// Returns `true` when a commit was created.
    pub async fn ensure_initial_commit(&self) -> Result<bool, WorkspaceError> {
        let _guard = self.init_lock.lock().await;

        if !self.repo_root.exists()
            || run_git(&self.repo_root, &["rev-parse", "--git-dir"]).await.is_err()
        {
            return Err(WorkspaceError::NotARepository(
                self.repo_root.display().to_string(),
            ));
        }
        if run_git(&self.repo_root, &["rev-parse", "--verify", "HEAD"])
            .await
            .is_ok()
        {
            return Ok(false);
        }

        let mut args: Vec<&str> = COMMIT_IDENTITY.to_vec();
        args.extend(["commit", "--allow-empty", "-m", "Initial commit"]);
        run_git(&self.repo_root, &args).await?;
        info!(repo = %self.repo_root.display(), "Created initial commit in empty repository");
        Ok(true)
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        run_git(&self.repo_root, &["rev-parse", "--verify", "--quiet", &reference])
            .await
            .is_ok()
    }
}

#[async_trait]
impl WorkspaceBackend for GitWorktreeBackend {
    async fn create_workspace(&self, key: &str) -> Result<Workspace, WorkspaceError> {
        validate_name(key)?;
        if key.contains('/') {
            return Err(WorkspaceError::InvalidName(format!(
                "workspace key cannot contain '/': {key}"
            )));
        }

        let branch = Self::branch_for(key);
        let path = self.base_dir.join(key);
        if path.exists() {
            return Err(WorkspaceError::PathExists(path.display().to_string()));
        }

        self.ensure_initial_commit().await?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let start = std::time::Instant::now();
        let output = tokio::process::Command::new("git")
            .args(["worktree", "add", "-b", &branch])
            .arg(&path)
            .current_dir(&self.repo_root)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkspaceError::Git(format!(
                "git worktree add failed: {}",
                stderr.trim()
            )));
        }

        info!(
            key,
            path = %path.display(),
            branch = %branch,
            elapsed_ms = start.elapsed().as_millis(),
            "Created git worktree"
        );
        Ok(Workspace {
            key: key.to_string(),
            path,
            branch: Some(branch),
        })
    }

    async fn remove_workspace(&self, path: &Path) -> Result<(), WorkspaceError> {
        if path.exists() {
            let output = tokio::process::Command::new("git")
                .args(["worktree", "remove", "--force"])
                .arg(path)
                .current_dir(&self.repo_root)
                .output()
                .await?;

            if output.status.success() {
                info!(path = %path.display(), "Removed git worktree");
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(path = %path.display(), error = %stderr.trim(), "git worktree remove failed, deleting directory");
                tokio::fs::remove_dir_all(path).await?;
            }
        }

        // Drop administrative entries for worktrees deleted behind git's back.
        if let Err(e) = run_git(&self.repo_root, &["worktree", "prune"]).await {
            debug!(error = %e, "git worktree prune failed");
        }
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), WorkspaceError> {
        validate_name(branch)?;
        if !self.branch_exists(branch).await {
            debug!(branch, "Branch already gone");
            return Ok(());
        }
        run_git(&self.repo_root, &["branch", "-D", branch]).await?;
        info!(branch, "Deleted branch");
        Ok(())
    }

    async fn changed_files(&self, path: &Path) -> Result<Vec<String>, WorkspaceError> {
        let stdout = run_git(path, &["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&stdout))
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(WorkspaceError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

/// Paths from `git status --porcelain`; renames report the new path.
fn parse_porcelain(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let entry = &line[3..];
            entry
                .rsplit_once(" -> ")
                .map_or(entry, |(_, to)| to)
                .trim_matches('"')
                .to_string()
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let output = std::process::Command::new("git")
            .args(COMMIT_IDENTITY)
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed: {output:?}");
    }

    fn empty_repo() -> tempfile::TempDir {
        let repo = tempfile::tempdir().unwrap();
        git(repo.path(), &["init"]);
        repo
    }

    #[test]
    fn porcelain_parsing_handles_renames() {
        let out = " M src/lib.rs\n?? notes.md\nR  old.rs -> new.rs\n";
        assert_eq!(parse_porcelain(out), vec!["src/lib.rs", "notes.md", "new.rs"]);
    }

    #[tokio::test]
    async fn initial_commit_is_synthesized_once() {
        let repo = empty_repo();
        let base = tempfile::tempdir().unwrap();
        let backend = GitWorktreeBackend::new(repo.path(), base.path());

        assert!(backend.ensure_initial_commit().await.unwrap());
        assert!(!backend.ensure_initial_commit().await.unwrap());
    }

    #[tokio::test]
    async fn create_in_empty_repo_succeeds() {
        let repo = empty_repo();
        let base = tempfile::tempdir().unwrap();
        let backend = GitWorktreeBackend::new(repo.path(), base.path().join("ws"));

        let ws = backend.create_workspace("backend-1").await.unwrap();
        assert!(ws.path.starts_with(base.path()));
        assert!(ws.path.exists());
        assert_eq!(ws.branch.as_deref(), Some("conductor/backend-1"));
        assert_eq!(backend.list_workspaces().await.unwrap(), vec![ws.path.clone()]);
    }

    #[tokio::test]
    async fn create_outside_repository_fails() {
        let not_repo = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let backend = GitWorktreeBackend::new(not_repo.path(), base.path());

        let err = backend.create_workspace("qa-1").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::NotARepository(_)));
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let repo = empty_repo();
        let base = tempfile::tempdir().unwrap();
        let backend = GitWorktreeBackend::new(repo.path(), base.path());

        backend.create_workspace("ux-1").await.unwrap();
        let err = backend.create_workspace("ux-1").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::PathExists(_)));
    }

    #[tokio::test]
    async fn remove_then_delete_branch() {
        let repo = empty_repo();
        let base = tempfile::tempdir().unwrap();
        let backend = GitWorktreeBackend::new(repo.path(), base.path());

        let ws = backend.create_workspace("general-1").await.unwrap();
        std::fs::write(ws.path.join("scratch.txt"), "wip").unwrap();
        assert_eq!(
            backend.changed_files(&ws.path).await.unwrap(),
            vec!["scratch.txt"]
        );

        backend.remove_workspace(&ws.path).await.unwrap();
        assert!(!ws.path.exists());
        // Second removal is a no-op.
        backend.remove_workspace(&ws.path).await.unwrap();

        let branch = ws.branch.unwrap();
        assert!(backend.branch_exists(&branch).await);
        backend.delete_branch(&branch).await.unwrap();
        assert!(!backend.branch_exists(&branch).await);
        backend.delete_branch(&branch).await.unwrap();
    }
}
