//! Merge Coordinator: merges worker branches onto a feature branch, runs
//! post-merge validation, and rebases trailing branches onto the new tip.

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct MergeFlowResult {
    pub success: bool,
    pub level: u32,
    pub merge_commit: Option<String>,
    pub error: Option<String>,
}

pub struct MergeCoordinator {
    repo_path: std::path::PathBuf,
    post_merge_validation: Vec<String>,
}

impl MergeCoordinator {
    pub fn new(repo_path: std::path::PathBuf, post_merge_validation: Vec<String>) -> Self {
        Self {
            repo_path,
            post_merge_validation,
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<(bool, String)> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    async fn run_git_in(&self, dir: &std::path::Path, args: &[&str]) -> Result<(bool, String)> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    async fn rev_parse(&self, rev: &str) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", rev])
            .current_dir(&self.repo_path)
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Runs the full merge flow for one level: checkout the target branch,
    /// merge each source branch in ascending worker-id order (no-fast-
    /// forward), run post-merge validation, tag the tip, then rebase any
    /// later-level branches already spawned onto the new tip.
    ///
    /// A conflict or validation failure leaves the target branch advanced by
    /// whatever subset merged cleanly before the failure — no automatic
    /// revert.
    pub async fn full_merge_flow(
        &self,
        level: u32,
        source_branches: &[String],
        target_branch: &str,
        trailing_branches: &[(String, std::path::PathBuf)],
    ) -> Result<MergeFlowResult> {
        let (ok, stderr) = self.run_git(&["checkout", target_branch]).await?;
        if !ok {
            return Ok(MergeFlowResult {
                success: false,
                level,
                merge_commit: None,
                error: Some(format!("failed to checkout {target_branch}: {stderr}")),
            });
        }

        for branch in source_branches {
            let message = format!("Merge worker branch {branch} (level {level})");
            let (ok, stderr) = self
                .run_git(&["merge", "--no-ff", "-m", &message, branch])
                .await?;
            if !ok {
                warn!(level, branch, "merge conflict, aborting");
                self.run_git(&["merge", "--abort"]).await.ok();
                return Ok(MergeFlowResult {
                    success: false,
                    level,
                    merge_commit: None,
                    error: Some(format!("conflict merging {branch}: {stderr}")),
                });
            }
            info!(level, branch, "merged worker branch");
        }

        for command in &self.post_merge_validation {
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.repo_path)
                .output()
                .await?;
            if !output.status.success() {
                return Ok(MergeFlowResult {
                    success: false,
                    level,
                    merge_commit: None,
                    error: Some(format!(
                        "post-merge validation failed ({command}): {}",
                        String::from_utf8_lossy(&output.stderr)
                    )),
                });
            }
        }

        let tip = self.rev_parse("HEAD").await?;
        let tag = format!("zerg/level-{level}-merged");
        self.run_git(&["tag", "-f", &tag, &tip]).await?;

        // Trailing branches are checked out in their worker's own worktree,
        // so the rebase runs there rather than via `checkout` in the main
        // repo (git refuses to check out a branch already held by another
        // worktree).
        for (branch, worktree) in trailing_branches {
            let (ok, stderr) = self.run_git_in(worktree, &["rebase", target_branch]).await?;
            if !ok {
                self.run_git_in(worktree, &["rebase", "--abort"]).await.ok();
                return Ok(MergeFlowResult {
                    success: false,
                    level,
                    merge_commit: Some(tip),
                    error: Some(format!("rebase of {branch} failed: {stderr}")),
                });
            }
        }
        self.run_git(&["checkout", target_branch]).await.ok();

        Ok(MergeFlowResult {
            success: true,
            level,
            merge_commit: Some(tip),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn run(dir: &std::path::Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {:?} failed: {}", args, String::from_utf8_lossy(&status.stderr));
    }

    async fn init_repo(dir: &std::path::Path) {
        run(dir, &["init", "-q", "-b", "main"]).await;
        run(dir, &["config", "user.email", "t@example.com"]).await;
        run(dir, &["config", "user.name", "t"]).await;
        std::fs::write(dir.join("a.txt"), "base").unwrap();
        run(dir, &["add", "."]).await;
        run(dir, &["commit", "-q", "-m", "init"]).await;
    }

    #[tokio::test]
    async fn merges_two_clean_branches() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path()).await;

        run(tmp.path(), &["checkout", "-b", "feat/worker-1"]).await;
        std::fs::write(tmp.path().join("w1.txt"), "w1").unwrap();
        run(tmp.path(), &["add", "."]).await;
        run(tmp.path(), &["commit", "-q", "-m", "w1"]).await;

        run(tmp.path(), &["checkout", "main"]).await;
        run(tmp.path(), &["checkout", "-b", "feat/worker-2"]).await;
        std::fs::write(tmp.path().join("w2.txt"), "w2").unwrap();
        run(tmp.path(), &["add", "."]).await;
        run(tmp.path(), &["commit", "-q", "-m", "w2"]).await;

        run(tmp.path(), &["checkout", "main"]).await;

        let coordinator = MergeCoordinator::new(tmp.path().to_path_buf(), vec!["true".to_string()]);
        let result = coordinator
            .full_merge_flow(
                1,
                &["feat/worker-1".to_string(), "feat/worker-2".to_string()],
                "main",
                &[],
            )
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.error);
        assert!(result.merge_commit.is_some());
        assert!(tmp.path().join("w1.txt").exists());
        assert!(tmp.path().join("w2.txt").exists());
    }

    #[tokio::test]
    async fn conflicting_branches_report_failure_and_leave_partial_merge() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path()).await;

        run(tmp.path(), &["checkout", "-b", "feat/worker-1"]).await;
        std::fs::write(tmp.path().join("a.txt"), "w1-change").unwrap();
        run(tmp.path(), &["commit", "-qa", "-m", "w1"]).await;

        run(tmp.path(), &["checkout", "main"]).await;
        run(tmp.path(), &["checkout", "-b", "feat/worker-2"]).await;
        std::fs::write(tmp.path().join("a.txt"), "w2-change").unwrap();
        run(tmp.path(), &["commit", "-qa", "-m", "w2"]).await;

        run(tmp.path(), &["checkout", "main"]).await;

        let coordinator = MergeCoordinator::new(tmp.path().to_path_buf(), vec![]);
        let result = coordinator
            .full_merge_flow(
                1,
                &["feat/worker-1".to_string(), "feat/worker-2".to_string()],
                "main",
                &[],
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("worker-2"));
        // worker-1's change made it onto main before the conflict.
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "w1-change");
    }
}
