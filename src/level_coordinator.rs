//! Level Coordinator: the bounded-retry merge protocol that finalizes a
//! level once all of its tasks have resolved.

use tokio::time::{sleep, timeout, Duration};
use tracing::{info, warn};

use crate::config::ZergConfig;
use crate::error::Result;
use crate::merge::MergeCoordinator;
use crate::state::{LevelRunStatus, MergeStatus, StateStore};

pub struct LevelCoordinator<'a> {
    state: &'a StateStore,
    merge: &'a MergeCoordinator,
    config: &'a ZergConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelOutcome {
    Complete,
    PausedForIntervention { reason: String },
}

impl<'a> LevelCoordinator<'a> {
    pub fn new(state: &'a StateStore, merge: &'a MergeCoordinator, config: &'a ZergConfig) -> Self {
        Self { state, merge, config }
    }

    /// Runs the merge-timeout + exponential-backoff retry loop for one
    /// level. Each attempt is bounded by `merge_timeout_seconds`; a timed-out
    /// attempt is abandoned, not merely orphaned, and the next attempt
    /// starts from scratch at the current feature-branch tip.
    pub async fn finalize_level(
        &self,
        level: u32,
        source_branches: &[String],
        target_branch: &str,
        trailing_branches: &[(String, std::path::PathBuf)],
    ) -> Result<LevelOutcome> {
        self.state
            .set_level_merge_status(level, MergeStatus::Merging, None)
            .await?;

        let mut last_error = String::new();

        for attempt in 1..=self.config.merge_max_retries {
            let flow = self
                .merge
                .full_merge_flow(level, source_branches, target_branch, trailing_branches);

            let outcome = timeout(
                Duration::from_secs(self.config.merge_timeout_seconds),
                flow,
            )
            .await;

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    self.record_retry(level, attempt, &last_error).await?;
                    if attempt < self.config.merge_max_retries {
                        sleep(Duration::from_secs(self.config.merge_backoff(attempt))).await;
                    }
                    continue;
                }
                Err(_) => {
                    last_error = format!(
                        "merge attempt {attempt} for level {level} timed out after {}s",
                        self.config.merge_timeout_seconds
                    );
                    warn!(level, attempt, "merge flow timed out, abandoning attempt");
                    self.record_retry(level, attempt, &last_error).await?;
                    if attempt < self.config.merge_max_retries {
                        sleep(Duration::from_secs(self.config.merge_backoff(attempt))).await;
                    }
                    continue;
                }
            };

            if result.success {
                self.state
                    .set_level_merge_status(level, MergeStatus::Complete, result.merge_commit.clone())
                    .await?;
                self.state
                    .set_level_status(level, LevelRunStatus::Complete, result.merge_commit.clone())
                    .await?;
                self.state
                    .append_event(
                        "level_complete",
                        serde_json::json!({"level": level, "merge_commit": result.merge_commit}),
                    )
                    .await?;
                info!(level, "level finalized");
                return Ok(LevelOutcome::Complete);
            }

            last_error = result.error.unwrap_or_else(|| "unknown merge failure".to_string());
            self.record_retry(level, attempt, &last_error).await?;
            if attempt < self.config.merge_max_retries {
                sleep(Duration::from_secs(self.config.merge_backoff(attempt))).await;
            }
        }

        self.state
            .set_level_merge_status(level, MergeStatus::Failed, Some(last_error.clone()))
            .await?;
        self.state
            .append_event("recoverable_error", serde_json::json!({"error": last_error}))
            .await?;
        warn!(level, "level exhausted merge retries, pausing for intervention");

        Ok(LevelOutcome::PausedForIntervention { reason: last_error })
    }

    async fn record_retry(&self, level: u32, attempt: u32, error: &str) -> Result<()> {
        let backoff_seconds = self.config.merge_backoff(attempt);
        self.state
            .append_event(
                "merge_retry",
                serde_json::json!({
                    "level": level,
                    "attempt": attempt,
                    "backoff_seconds": backoff_seconds,
                    "error": error,
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn run(dir: &std::path::Path, args: &[&str]) {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "{:?}", String::from_utf8_lossy(&out.stderr));
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
    async fn finalize_succeeds_on_first_attempt() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path()).await;
        run(tmp.path(), &["checkout", "-b", "feat/worker-1"]).await;
        std::fs::write(tmp.path().join("w1.txt"), "w1").unwrap();
        run(tmp.path(), &["add", "."]).await;
        run(tmp.path(), &["commit", "-q", "-m", "w1"]).await;
        run(tmp.path(), &["checkout", "main"]).await;

        let state_dir = tempdir().unwrap();
        let state = StateStore::new(state_dir.path(), "demo");
        let merge = MergeCoordinator::new(tmp.path().to_path_buf(), vec![]);
        let config = ZergConfig::default();
        let coordinator = LevelCoordinator::new(&state, &merge, &config);

        let outcome = coordinator
            .finalize_level(1, &["feat/worker-1".to_string()], "main", &[])
            .await
            .unwrap();

        assert_eq!(outcome, LevelOutcome::Complete);
        assert_eq!(state.get_level_merge_status(1).await.unwrap(), MergeStatus::Complete);
    }

    #[tokio::test]
    async fn finalize_pauses_after_exhausting_retries_on_conflict() {
        let tmp = tempdir().unwrap();
        init_repo(tmp.path()).await;

        run(tmp.path(), &["checkout", "-b", "feat/worker-1"]).await;
        std::fs::write(tmp.path().join("a.txt"), "w1").unwrap();
        run(tmp.path(), &["commit", "-qa", "-m", "w1"]).await;

        run(tmp.path(), &["checkout", "main"]).await;
        run(tmp.path(), &["checkout", "-b", "feat/worker-2"]).await;
        std::fs::write(tmp.path().join("a.txt"), "w2").unwrap();
        run(tmp.path(), &["commit", "-qa", "-m", "w2"]).await;

        run(tmp.path(), &["checkout", "main"]).await;

        let state_dir = tempdir().unwrap();
        let state = StateStore::new(state_dir.path(), "demo");
        let merge = MergeCoordinator::new(tmp.path().to_path_buf(), vec![]);
        let mut config = ZergConfig::default();
        config.merge_max_retries = 2;

        let coordinator = LevelCoordinator::new(&state, &merge, &config);
        let outcome = coordinator
            .finalize_level(
                1,
                &["feat/worker-1".to_string(), "feat/worker-2".to_string()],
                "main",
                &[],
            )
            .await
            .unwrap();

        assert!(matches!(outcome, LevelOutcome::PausedForIntervention { .. }));
        assert_eq!(state.get_level_merge_status(1).await.unwrap(), MergeStatus::Failed);

        let snapshot = state.status_snapshot().await.unwrap();
        let retries = snapshot
            .execution_log
            .iter()
            .filter(|e| e.event == "merge_retry")
            .count();
        assert_eq!(retries, 2);
    }
}
