//! Worktree Manager: one isolated git working directory per worker, each on
//! its own branch, so concurrent workers never collide on the filesystem.
//!
//! Grounded on the shell-command worktree manager style used by the coding
//! agent orchestrator this crate is descended from: git is driven via
//! `tokio::process::Command` rather than a bindings crate like `git2`, since
//! the operations needed (`worktree add`/`remove`, branch queries) map
//! directly onto porcelain subcommands.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, ZergError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorktreeManager {
    repo_path: PathBuf,
    worktrees_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_path: PathBuf) -> Self {
        let worktrees_root = repo_path.join(".worktrees");
        Self {
            repo_path,
            worktrees_root,
        }
    }

    /// Namespaced under `zerg/` so a worker branch never collides with the
    /// feature branch itself in git's ref hierarchy (a ref cannot be both a
    /// leaf and a path prefix, e.g. `refs/heads/feat` and
    /// `refs/heads/feat/worker-1` cannot coexist).
    pub fn branch_name(feature: &str, worker_id: u32) -> String {
        format!("zerg/{feature}/worker-{worker_id}")
    }

    fn worktree_path(&self, feature: &str, worker_id: u32) -> PathBuf {
        self.worktrees_root
            .join(feature)
            .join(format!("worker-{worker_id}"))
    }

    pub fn get_worktree_path(&self, feature: &str, worker_id: u32) -> Option<PathBuf> {
        let path = self.worktree_path(feature, worker_id);
        path.exists().then_some(path)
    }

    /// Creates a worker's worktree on a deterministic branch
    /// (`<feature>/worker-<id>`), cut from the current feature branch tip.
    pub async fn create(&self, feature: &str, worker_id: u32) -> Result<WorktreeInfo> {
        let branch = Self::branch_name(feature, worker_id);
        let path = self.worktree_path(feature, worker_id);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch])
            .arg(&path)
            .arg(feature)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| ZergError::worktree(format!("failed to spawn git worktree add: {e}")))?;

        if !output.status.success() {
            return Err(ZergError::worktree(format!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        info!(worker_id, branch = %branch, path = %path.display(), "created worktree");
        Ok(WorktreeInfo { path, branch })
    }

    /// Removes the worktree directory, and optionally its branch. Tolerates
    /// stale lock files left behind by a crash (git's `--force` flag clears
    /// them).
    pub async fn delete(&self, info: &WorktreeInfo, force: bool) -> Result<()> {
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }

        let output = Command::new("git")
            .args(&args)
            .arg(&info.path)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| ZergError::worktree(format!("failed to spawn git worktree remove: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if info.path.exists() {
                warn!(
                    path = %info.path.display(),
                    "git worktree remove failed ({stderr}), forcing directory removal"
                );
                tokio::fs::remove_dir_all(&info.path).await.ok();
                let _ = Command::new("git")
                    .args(["worktree", "prune"])
                    .current_dir(&self.repo_path)
                    .output()
                    .await;
            }
        }

        if force {
            let _ = Command::new("git")
                .args(["branch", "-D", &info.branch])
                .current_dir(&self.repo_path)
                .output()
                .await;
        }

        info!(branch = %info.branch, "deleted worktree");
        Ok(())
    }

    pub async fn prune(&self) -> Result<()> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| ZergError::worktree(format!("failed to spawn git worktree prune: {e}")))?;
        if !output.status.success() {
            return Err(ZergError::worktree(format!(
                "git worktree prune failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.worktrees_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap()
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "t"]);
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
        run(&["branch", "feat"]);
    }

    #[tokio::test]
    async fn create_and_delete_roundtrip() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path()).await;
        let mgr = WorktreeManager::new(tmp.path().to_path_buf());

        let info = mgr.create("feat", 1).await.unwrap();
        assert_eq!(info.branch, "zerg/feat/worker-1");
        assert!(info.path.exists());
        assert!(mgr.get_worktree_path("feat", 1).is_some());

        mgr.delete(&info, false).await.unwrap();
        assert!(mgr.get_worktree_path("feat", 1).is_none());
    }
}
