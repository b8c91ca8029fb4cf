//! Worker Launcher: a polymorphic abstraction over the backend that runs a
//! worker instance. Two variants ship: `subprocess` (host child process) and
//! `container` (feature-gated, via `bollard`).
//!
//! One concurrency discipline is used throughout (see design notes): every
//! operation is `async`, on the single tokio runtime. There is no separate
//! sync/async API surface.

#[cfg(feature = "container")]
pub mod container;
pub mod subprocess;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

use crate::error::Result;
use crate::state::WorkerStatus;

/// Environment variables always injected at spawn time, regardless of
/// backend.
pub struct WorkerEnv {
    pub worker_id: u32,
    pub feature: String,
    pub task_id: Option<String>,
    pub worktree: PathBuf,
    pub branch: String,
    pub spec_dir: PathBuf,
    pub state_dir: PathBuf,
    pub repo_path: PathBuf,
    pub log_dir: PathBuf,
    pub task_graph: Option<PathBuf>,
}

const ALLOWED_ENV_VARS: &[&str] = &[
    "CI",
    "DEBUG",
    "LOG_LEVEL",
    "VERBOSE",
    "TERM",
    "COLORTERM",
    "NO_COLOR",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "NODE_ENV",
    "PYTHON_ENV",
    "RUST_BACKTRACE",
    "PYTEST_CURRENT_TEST",
];

const DENYLIST: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "PYTHONPATH",
    "NODE_PATH",
    "HOME",
    "USER",
    "SHELL",
    "TMPDIR",
    "TMP",
    "TEMP",
];

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '<', '>'];

/// Builds the full environment for a worker: the mandatory `ZERG_*`
/// injections plus whatever of `env_overrides` survives the allow/deny-list
/// and shell-metacharacter filter. Rejections are logged, never fatal.
pub fn build_environment(
    base: &WorkerEnv,
    env_overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("ZERG_WORKER_ID".to_string(), base.worker_id.to_string());
    env.insert("ZERG_FEATURE".to_string(), base.feature.clone());
    env.insert(
        "ZERG_WORKTREE".to_string(),
        base.worktree.to_string_lossy().into_owned(),
    );
    env.insert("ZERG_BRANCH".to_string(), base.branch.clone());
    env.insert(
        "ZERG_SPEC_DIR".to_string(),
        base.spec_dir.to_string_lossy().into_owned(),
    );
    env.insert(
        "ZERG_STATE_DIR".to_string(),
        base.state_dir.to_string_lossy().into_owned(),
    );
    env.insert(
        "ZERG_REPO_PATH".to_string(),
        base.repo_path.to_string_lossy().into_owned(),
    );
    env.insert(
        "ZERG_LOG_DIR".to_string(),
        base.log_dir.to_string_lossy().into_owned(),
    );
    if let Some(task_id) = &base.task_id {
        env.insert("ZERG_TASK_ID".to_string(), task_id.clone());
    }
    if let Some(graph) = &base.task_graph {
        env.insert(
            "ZERG_TASK_GRAPH".to_string(),
            graph.to_string_lossy().into_owned(),
        );
    }

    let allowed: HashSet<&str> = ALLOWED_ENV_VARS.iter().copied().collect();
    let denied: HashSet<&str> = DENYLIST.iter().copied().collect();

    for (key, value) in env_overrides {
        let upper = key.to_uppercase();
        if denied.contains(upper.as_str()) {
            warn!(key, "rejected denylisted environment variable");
            continue;
        }
        if !(upper.starts_with("ZERG_") || allowed.contains(upper.as_str())) {
            warn!(key, "skipping unlisted environment variable");
            continue;
        }
        if value.contains(SHELL_METACHARACTERS) {
            warn!(key, "rejected environment variable containing shell metacharacters");
            continue;
        }
        env.insert(key.clone(), value.clone());
    }

    env
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResult {
    pub success: bool,
    pub worker_id: u32,
    pub handle: Option<WorkerHandle>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub worker_id: u32,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// Decodes a worker's exit code into the soft-exit-code protocol:
/// `0` = clean exit, `2` = checkpoint, `3` = blocked, anything else = crash.
pub fn status_from_exit_code(code: i32) -> WorkerStatus {
    match code {
        0 => WorkerStatus::Stopped,
        2 => WorkerStatus::Checkpointing,
        3 => WorkerStatus::Blocked,
        _ => WorkerStatus::Crashed,
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn spawn(
        &self,
        worker_id: u32,
        env: WorkerEnv,
        env_overrides: HashMap<String, String>,
    ) -> Result<SpawnResult>;

    async fn monitor(&self, worker_id: u32) -> Result<WorkerStatus>;

    async fn terminate(&self, worker_id: u32, force: bool) -> Result<bool>;

    async fn get_output(&self, worker_id: u32, tail: usize) -> Result<String>;

    async fn get_handle(&self, worker_id: u32) -> Result<Option<WorkerHandle>>;

    async fn terminate_all(&self, force: bool) -> Result<HashMap<u32, bool>>;

    /// Reconciles tracked handles with reality: for every tracked worker,
    /// re-checks its status; any that are `Stopped`/`Crashed` are dropped
    /// from the tracked map. Returns the reconciled statuses.
    async fn sync_state(&self) -> Result<HashMap<u32, WorkerStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> WorkerEnv {
        WorkerEnv {
            worker_id: 1,
            feature: "demo".into(),
            task_id: Some("t1".into()),
            worktree: "/tmp/wt".into(),
            branch: "demo/worker-1".into(),
            spec_dir: "/tmp/spec".into(),
            state_dir: "/tmp/state".into(),
            repo_path: "/tmp/repo".into(),
            log_dir: "/tmp/logs".into(),
            task_graph: None,
        }
    }

    #[test]
    fn injects_mandatory_vars() {
        let result = build_environment(&env(), &HashMap::new());
        for key in [
            "ZERG_WORKER_ID",
            "ZERG_FEATURE",
            "ZERG_WORKTREE",
            "ZERG_BRANCH",
            "ZERG_SPEC_DIR",
            "ZERG_STATE_DIR",
            "ZERG_REPO_PATH",
            "ZERG_LOG_DIR",
            "ZERG_TASK_ID",
        ] {
            assert!(result.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn denylist_is_never_propagated() {
        let mut overrides = HashMap::new();
        overrides.insert("PATH".to_string(), "/evil".to_string());
        overrides.insert("LD_PRELOAD".to_string(), "/evil.so".to_string());
        let result = build_environment(&env(), &overrides);
        assert!(!result.contains_key("PATH"));
        assert!(!result.contains_key("LD_PRELOAD"));
    }

    #[test]
    fn shell_metacharacters_are_dropped() {
        let mut overrides = HashMap::new();
        overrides.insert("CI".to_string(), "true; rm -rf /".to_string());
        let result = build_environment(&env(), &overrides);
        assert!(!result.contains_key("CI"));
    }

    #[test]
    fn zerg_prefixed_overrides_pass_through() {
        let mut overrides = HashMap::new();
        overrides.insert("ZERG_CUSTOM".to_string(), "value".to_string());
        let result = build_environment(&env(), &overrides);
        assert_eq!(result.get("ZERG_CUSTOM"), Some(&"value".to_string()));
    }

    #[test]
    fn unlisted_vars_are_dropped() {
        let mut overrides = HashMap::new();
        overrides.insert("SOME_RANDOM_VAR".to_string(), "x".to_string());
        let result = build_environment(&env(), &overrides);
        assert!(!result.contains_key("SOME_RANDOM_VAR"));
    }

    #[test]
    fn exit_code_decoding() {
        assert_eq!(status_from_exit_code(0), WorkerStatus::Stopped);
        assert_eq!(status_from_exit_code(2), WorkerStatus::Checkpointing);
        assert_eq!(status_from_exit_code(3), WorkerStatus::Blocked);
        assert_eq!(status_from_exit_code(1), WorkerStatus::Crashed);
        assert_eq!(status_from_exit_code(137), WorkerStatus::Crashed);
    }
}
