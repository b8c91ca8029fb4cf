//! Orchestrator: the top-level state machine. Owns the run, selects a
//! launcher backend, drives levels to completion, and reacts to worker
//! exits.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::circuit_breaker::{Backpressure, CircuitBreaker};
use crate::config::ZergConfig;
use crate::error::{Result, ZergError};
use crate::launcher::subprocess::SubprocessLauncher;
use crate::launcher::{WorkerEnv, WorkerLauncher};
use crate::level_coordinator::{LevelCoordinator, LevelOutcome};
use crate::merge::MergeCoordinator;
use crate::ports::PortAllocator;
use crate::state::{StateStore, TaskStatus, WorkerState, WorkerStatus};
use crate::task_graph::TaskGraph;
use crate::verify::verify;
use crate::worktree::{WorktreeInfo, WorktreeManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherMode {
    Subprocess,
    Container,
}

/// Resolves a configured launcher mode string into a concrete backend
/// choice. `auto` picks `container` iff a devcontainer configuration exists
/// in the repository and (when the `container` feature is compiled in) the
/// runtime is reachable and the configured image is present locally; any
/// unknown mode is a fatal configuration error.
pub async fn resolve_launcher_mode(mode: &str, repo_path: &Path) -> Result<LauncherMode> {
    match mode {
        "subprocess" => Ok(LauncherMode::Subprocess),
        "container" => Ok(LauncherMode::Container),
        "auto" => {
            let devcontainer_present = repo_path.join(".devcontainer").exists();
            #[cfg(feature = "container")]
            {
                if devcontainer_present {
                    if let Ok(docker) = bollard::Docker::connect_with_local_defaults() {
                        if docker.ping().await.is_ok() {
                            return Ok(LauncherMode::Container);
                        }
                    }
                }
            }
            #[cfg(not(feature = "container"))]
            let _ = devcontainer_present;
            Ok(LauncherMode::Subprocess)
        }
        other => Err(ZergError::config(format!("unknown launcher mode: {other}"))),
    }
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub percent: f64,
}

#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub tasks_completed: u32,
}

#[derive(Debug, Clone)]
pub struct OrchestratorStatus {
    pub feature: String,
    pub running: bool,
    pub paused: bool,
    pub current_level: u32,
    pub progress: Progress,
    pub workers: HashMap<u32, WorkerSummary>,
    pub is_complete: bool,
}

type TaskCallback = Box<dyn Fn(&str) + Send + Sync>;
type LevelCallback = Box<dyn Fn(u32) + Send + Sync>;

pub struct Orchestrator {
    feature: String,
    config: ZergConfig,
    graph: TaskGraph,
    state: StateStore,
    ports: PortAllocator,
    worktrees: WorktreeManager,
    launcher: Arc<dyn WorkerLauncher>,
    merge: MergeCoordinator,
    circuit_breaker: CircuitBreaker,
    backpressure: DashMap<u32, Backpressure>,
    active_worktrees: DashMap<u32, WorktreeInfo>,
    active_ports: DashMap<u32, u16>,
    blocked_slots: DashSet<u32>,
    worker_count: AtomicUsize,
    running: AtomicBool,
    finished: AtomicBool,
    on_task_complete: AsyncMutex<Vec<TaskCallback>>,
    on_level_complete: AsyncMutex<Vec<LevelCallback>>,
    repo_path: PathBuf,
    spec_dir: PathBuf,
    state_dir: PathBuf,
    log_dir: PathBuf,
    task_graph_path: Option<PathBuf>,
}

use std::sync::atomic::AtomicUsize;

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feature: String,
        config: ZergConfig,
        graph: TaskGraph,
        repo_path: PathBuf,
        state_dir: PathBuf,
        spec_dir: PathBuf,
        log_dir: PathBuf,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let ports = PortAllocator::new(config.ports.range_start, config.ports.range_end);
        let worktrees = WorktreeManager::new(repo_path.clone());
        let merge = MergeCoordinator::new(repo_path.clone(), vec![]);
        let circuit_breaker = CircuitBreaker::new(config.error_recovery.circuit_breaker.clone());
        let state = StateStore::new(&state_dir, &feature);
        Self {
            feature,
            config,
            graph,
            state,
            ports,
            worktrees,
            launcher,
            merge,
            circuit_breaker,
            backpressure: DashMap::new(),
            active_worktrees: DashMap::new(),
            active_ports: DashMap::new(),
            blocked_slots: DashSet::new(),
            worker_count: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            on_task_complete: AsyncMutex::new(Vec::new()),
            on_level_complete: AsyncMutex::new(Vec::new()),
            repo_path,
            spec_dir,
            state_dir,
            log_dir,
            task_graph_path: None,
        }
    }

    pub async fn on_task_complete<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_task_complete.lock().await.push(Box::new(callback));
    }

    pub async fn on_level_complete<F>(&self, callback: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_level_complete.lock().await.push(Box::new(callback));
    }

    fn target_branch(&self) -> &str {
        &self.feature
    }

    fn backpressure_for(&self, level: u32) -> dashmap::mapref::one::Ref<'_, u32, Backpressure> {
        self.backpressure
            .entry(level)
            .or_insert_with(|| Backpressure::new(self.config.error_recovery.backpressure.clone()));
        self.backpressure.get(&level).unwrap()
    }

    /// Entry point: parses nothing further (the graph is already parsed at
    /// construction), loads state, emits `run_started`, and either returns
    /// immediately (`dry_run`) or spawns the initial worker pool and enters
    /// the main loop.
    pub async fn start(
        &self,
        worker_count: u32,
        start_level: Option<u32>,
        dry_run: bool,
    ) -> Result<()> {
        self.worker_count.store(worker_count as usize, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let state = self.state.load().await?;
        let level = start_level.unwrap_or_else(|| {
            if state.current_level > 0 {
                state.current_level
            } else {
                self.graph.levels().first().copied().unwrap_or(0)
            }
        });

        self.state
            .append_event(
                "run_started",
                serde_json::json!({"worker_count": worker_count, "start_level": level}),
            )
            .await?;

        if dry_run {
            info!(feature = %self.feature, level, worker_count, "dry run: plan computed, not spawning");
            return Ok(());
        }

        self.start_level(level).await?;

        let mut spawned = 0;
        for worker_id in 1..=worker_count {
            if self.spawn_worker(worker_id, level).await? {
                spawned += 1;
            }
        }

        if spawned == 0 {
            self.state
                .append_event(
                    "rush_failed",
                    serde_json::json!({"reason": "No workers spawned", "requested": worker_count}),
                )
                .await?;
            self.running.store(false, Ordering::SeqCst);
            return Err(ZergError::other("No workers spawned"));
        }

        while self.running.load(Ordering::SeqCst) && !self.finished.load(Ordering::SeqCst) {
            if let Err(e) = self.tick().await {
                if !e.is_recoverable() {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                warn!(feature = %self.feature, error = %e, "recoverable error in tick, pausing for intervention");
                self.state.set_error(Some(e.to_string())).await?;
                self.state.set_paused(true).await?;
            }
            sleep(Duration::from_millis(200)).await;
        }

        Ok(())
    }

    pub async fn start_level(&self, level: u32) -> Result<()> {
        self.state.set_current_level(level).await?;
        self.state
            .set_level_status(level, crate::state::LevelRunStatus::Running, None)
            .await?;
        self.state
            .append_event(
                "level_started",
                serde_json::json!({"level": level, "tasks": self.graph.tasks_in_level(level)}),
            )
            .await?;
        Ok(())
    }

    fn worker_env(&self, worker_id: u32, task_id: Option<String>, worktree: &WorktreeInfo) -> WorkerEnv {
        WorkerEnv {
            worker_id,
            feature: self.feature.clone(),
            task_id,
            worktree: worktree.path.clone(),
            branch: worktree.branch.clone(),
            spec_dir: self.spec_dir.clone(),
            state_dir: self.state_dir.clone(),
            repo_path: self.repo_path.clone(),
            log_dir: self.log_dir.clone(),
            task_graph: self.task_graph_path.clone(),
        }
    }

    /// Attempts to claim one pending task in `level` and spawn a worker for
    /// it. Returns `false` (no-op, not a failure) when there is no claimable
    /// work or a breaker/backpressure mechanism currently forbids spawning.
    async fn spawn_worker(&self, worker_id: u32, level: u32) -> Result<bool> {
        if self.blocked_slots.contains(&worker_id) {
            return Ok(false);
        }
        if !self.circuit_breaker.allow_spawn() {
            return Ok(false);
        }
        if !self.backpressure_for(level).allow_spawn() {
            return Ok(false);
        }

        let task_id = match self.claim_next_pending(level, worker_id).await? {
            Some(id) => id,
            None => return Ok(false),
        };

        let port = match self.ports.allocate_one() {
            Ok(p) => p,
            Err(e) => {
                self.state.release_task(&task_id, worker_id).await?;
                return Err(e);
            }
        };

        let worktree = match self.worktrees.create(&self.feature, worker_id).await {
            Ok(w) => w,
            Err(e) => {
                self.ports.release(port);
                self.state.release_task(&task_id, worker_id).await?;
                self.circuit_breaker.record_crash();
                return Err(e);
            }
        };

        let env = self.worker_env(worker_id, Some(task_id.clone()), &worktree);
        let spawn_result = self.launcher.spawn(worker_id, env, HashMap::new()).await?;

        if !spawn_result.success {
            warn!(worker_id, task_id, error = ?spawn_result.error, "worker spawn failed");
            self.ports.release(port);
            self.worktrees.delete(&worktree, true).await.ok();
            self.state.release_task(&task_id, worker_id).await?;
            self.circuit_breaker.record_crash();
            return Ok(false);
        }

        self.active_ports.insert(worker_id, port);
        self.active_worktrees.insert(worker_id, worktree.clone());

        let mut worker_state = WorkerState::new(worker_id, worktree.path.clone(), worktree.branch.clone());
        worker_state.port = Some(port);
        worker_state.current_task = Some(task_id.clone());
        worker_state.launcher_handle = spawn_result
            .handle
            .as_ref()
            .and_then(|h| h.pid.map(|p| p.to_string()).or_else(|| h.container_id.clone()));
        self.state.set_worker_state(worker_state).await?;
        self.state
            .set_task_status(&task_id, TaskStatus::InProgress, Some(worker_id), None)
            .await?;
        self.state
            .append_event(
                "worker_started",
                serde_json::json!({"worker_id": worker_id, "port": port, "task_id": task_id}),
            )
            .await?;

        Ok(true)
    }

    async fn claim_next_pending(&self, level: u32, worker_id: u32) -> Result<Option<String>> {
        for task_id in self.graph.tasks_in_level(level) {
            if self.state.claim_task(task_id, worker_id).await? {
                return Ok(Some(task_id.clone()));
            }
        }
        Ok(None)
    }

    /// Releases a worker's resources (port, worktree) and clears it from the
    /// active-handle maps. Does not touch task state.
    async fn recycle_worker(&self, worker_id: u32) -> Result<()> {
        if let Some((_, port)) = self.active_ports.remove(&worker_id) {
            self.ports.release(port);
        }
        if let Some((_, info)) = self.active_worktrees.remove(&worker_id) {
            self.worktrees.delete(&info, false).await.ok();
        }
        self.state.remove_worker(worker_id).await?;
        Ok(())
    }

    /// Worker exited cleanly (exit code 0). Runs the task's verification
    /// command against the worker's worktree and resolves the task
    /// accordingly.
    async fn handle_task_complete(&self, worker_id: u32, task_id: &str) -> Result<()> {
        let worktree = self.active_worktrees.get(&worker_id).map(|e| e.path.clone());
        let Some(worktree_path) = worktree else {
            self.recycle_worker(worker_id).await?;
            return Ok(());
        };

        let task = self
            .graph
            .task(task_id)
            .ok_or_else(|| ZergError::other(format!("unknown task {task_id}")))?;

        let result = if task.verification_auto_passes() {
            crate::verify::VerificationResult {
                success: true,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            }
        } else {
            verify(
                &task.verification.command,
                &worktree_path,
                Duration::from_secs(task.verification.timeout_seconds),
            )
            .await
        };

        let level = task.level;

        // The worker itself exited cleanly here regardless of whether its
        // task passed verification, so it counts as a healthy half-open
        // probe outcome either way.
        self.circuit_breaker.record_success();

        if result.success {
            self.state
                .set_task_status(task_id, TaskStatus::Complete, Some(worker_id), None)
                .await?;
            self.state.reset_task_retry(task_id).await?;
            self.backpressure_for(level).record_outcome(true);
            for callback in self.on_task_complete.lock().await.iter() {
                callback(task_id);
            }
        } else {
            self.fail_task(task_id, worker_id, level, result.stderr).await?;
        }

        self.recycle_worker(worker_id).await
    }

    /// A task-level failure: counts toward the retry budget with exponential
    /// backoff, unlike a crash.
    async fn fail_task(&self, task_id: &str, worker_id: u32, level: u32, error: String) -> Result<()> {
        let retry_count = self.state.increment_task_retry(task_id).await?;
        self.backpressure_for(level).record_outcome(false);

        if retry_count >= self.config.retry.max_attempts {
            self.state
                .set_task_status(task_id, TaskStatus::Failed, Some(worker_id), Some(error.clone()))
                .await?;
            self.state
                .append_event(
                    "task_failed_permanent",
                    serde_json::json!({
                        "task_id": task_id, "worker_id": worker_id,
                        "retry_count": retry_count, "error": error,
                    }),
                )
                .await?;
        } else {
            let backoff_seconds = self.config.retry_backoff(retry_count);
            let next_retry_at = Utc::now() + chrono::Duration::seconds(backoff_seconds as i64);
            self.state
                .set_task_status(task_id, TaskStatus::Paused, Some(worker_id), Some(error.clone()))
                .await?;
            self.state.set_task_next_retry_at(task_id, next_retry_at).await?;
            self.state
                .append_event(
                    "task_retry_scheduled",
                    serde_json::json!({
                        "task_id": task_id, "worker_id": worker_id, "retry_count": retry_count,
                        "backoff_seconds": backoff_seconds, "next_retry_at": next_retry_at, "error": error,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// A worker crashed outside the soft exit-code protocol: requeues the
    /// task without penalizing its retry budget, and counts toward the
    /// circuit breaker.
    async fn handle_worker_crash(&self, worker_id: u32, task_id: Option<String>) -> Result<()> {
        if let Some(task_id) = task_id {
            self.state.release_task(&task_id, worker_id).await?;
        }
        self.circuit_breaker.record_crash();
        self.recycle_worker(worker_id).await
    }

    /// A voluntary checkpoint exit: pauses the current task without
    /// retry-budget penalty and recycles the slot.
    async fn handle_checkpoint(&self, worker_id: u32, task_id: Option<String>) -> Result<()> {
        if let Some(task_id) = task_id {
            self.state
                .set_task_status(&task_id, TaskStatus::Paused, Some(worker_id), None)
                .await?;
        }
        self.circuit_breaker.record_success();
        self.recycle_worker(worker_id).await
    }

    async fn handle_blocked(&self, worker_id: u32, task_id: Option<String>) -> Result<()> {
        if let Some(task_id) = &task_id {
            self.state
                .set_task_status(task_id, TaskStatus::Blocked, Some(worker_id), None)
                .await?;
        }
        self.state
            .append_event("worker_blocked", serde_json::json!({"worker_id": worker_id}))
            .await?;
        self.blocked_slots.insert(worker_id);
        self.circuit_breaker.record_success();
        self.recycle_worker(worker_id).await
    }

    /// One iteration of the main loop: reconcile worker statuses, react to
    /// terminal ones, requeue backoff-expired tasks, resolve the current
    /// level if possible, and top up idle worker slots.
    pub async fn tick(&self) -> Result<()> {
        let statuses = self.launcher.sync_state().await?;

        for (worker_id, status) in statuses {
            let worker = self.state.get_worker(worker_id).await?;
            let current_task = worker.and_then(|w| w.current_task);

            match status {
                WorkerStatus::Running | WorkerStatus::Ready | WorkerStatus::Initializing => {}
                WorkerStatus::Stopped => {
                    if let Some(task_id) = current_task {
                        self.handle_task_complete(worker_id, &task_id).await?;
                    } else {
                        self.recycle_worker(worker_id).await?;
                    }
                }
                WorkerStatus::Crashed => {
                    self.handle_worker_crash(worker_id, current_task).await?;
                }
                WorkerStatus::Checkpointing => {
                    self.handle_checkpoint(worker_id, current_task).await?;
                }
                WorkerStatus::Blocked => {
                    self.handle_blocked(worker_id, current_task).await?;
                }
                WorkerStatus::Idle | WorkerStatus::Stopping => {}
            }
        }

        let now = Utc::now();
        for task_id in self.state.get_tasks_ready_for_retry(now).await? {
            self.state.requeue_retry_ready_task(&task_id).await?;
        }

        let snapshot = self.state.status_snapshot().await?;
        let level = snapshot.current_level;
        self.resolve_level(level).await?;

        if !snapshot.paused && !self.finished.load(Ordering::SeqCst) {
            let worker_count = self.worker_count.load(Ordering::SeqCst) as u32;
            for worker_id in 1..=worker_count {
                if !self.active_worktrees.contains_key(&worker_id) {
                    self.spawn_worker(worker_id, level).await.ok();
                }
            }
        }

        Ok(())
    }

    async fn resolve_level(&self, level: u32) -> Result<()> {
        let task_ids = self.graph.tasks_in_level(level);

        if task_ids.is_empty() {
            self.state
                .set_level_status(level, crate::state::LevelRunStatus::Complete, None)
                .await?;
            self.state
                .append_event("level_complete", serde_json::json!({"level": level, "merge_commit": null}))
                .await?;
            self.advance_past(level).await?;
            return Ok(());
        }

        let mut all_terminal = true;
        let mut any_complete = false;
        let mut completed_workers: Vec<(u32, String)> = Vec::new();

        for task_id in task_ids {
            let record = self
                .state
                .status_snapshot()
                .await?
                .tasks
                .get(task_id)
                .cloned()
                .unwrap_or_default();
            if !record.status.is_terminal() {
                all_terminal = false;
            }
            if record.status == TaskStatus::Complete {
                any_complete = true;
                if let Some(worker_id) = record.worker_id {
                    completed_workers.push((worker_id, WorktreeManager::branch_name(&self.feature, worker_id)));
                }
            }
        }

        if !all_terminal {
            return Ok(());
        }

        if !any_complete {
            self.state
                .set_error(Some(format!("level {level}: no successful tasks to merge")))
                .await?;
            self.state.set_paused(true).await?;
            return Ok(());
        }

        completed_workers.sort_by_key(|(id, _)| *id);
        let source_branches: Vec<String> = completed_workers.into_iter().map(|(_, b)| b).collect();

        // Branches of workers already spawned against a later level (e.g. a
        // speculative pre-spawn or a worker carried over from a prior run)
        // need rebasing onto the new tip once this level's merge lands.
        let snapshot = self.state.status_snapshot().await?;
        let mut trailing_branches: Vec<(u32, String, PathBuf)> = snapshot
            .workers
            .values()
            .filter_map(|w| {
                let task_id = w.current_task.as_ref()?;
                let task_level = self.graph.task(task_id)?.level;
                (task_level > level).then(|| (w.worker_id, w.branch.clone(), w.worktree_path.clone()))
            })
            .collect();
        trailing_branches.sort_by_key(|(id, _, _)| *id);
        let trailing_branches: Vec<(String, PathBuf)> =
            trailing_branches.into_iter().map(|(_, b, p)| (b, p)).collect();

        let coordinator = LevelCoordinator::new(&self.state, &self.merge, &self.config);
        let outcome = coordinator
            .finalize_level(level, &source_branches, self.target_branch(), &trailing_branches)
            .await?;

        match outcome {
            LevelOutcome::Complete => {
                for callback in self.on_level_complete.lock().await.iter() {
                    callback(level);
                }
                self.advance_past(level).await?;
            }
            LevelOutcome::PausedForIntervention { .. } => {
                self.state.set_paused(true).await?;
            }
        }

        Ok(())
    }

    async fn advance_past(&self, level: u32) -> Result<()> {
        match self.graph.next_level(level) {
            Some(next) => self.start_level(next).await,
            None => {
                self.finished.store(false, Ordering::SeqCst);
                self.finished.store(true, Ordering::SeqCst);
                self.running.store(false, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    pub async fn stop(&self, force: bool) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.launcher.terminate_all(force).await?;
        self.ports.release_all();
        self.state
            .append_event("rush_stopped", serde_json::json!({"force": force}))
            .await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let state = self.state.load().await?;
        if state.paused {
            self.state.set_paused(false).await?;
            self.state.set_error(None).await?;
            self.state.append_event("resumed", serde_json::json!({})).await?;
        }
        Ok(())
    }

    pub async fn retry_task(&self, task_id: &str) -> Result<bool> {
        let state = self.state.load().await?;
        let Some(record) = state.tasks.get(task_id) else {
            return Ok(false);
        };
        if record.status != TaskStatus::Failed {
            return Ok(false);
        }
        self.state.reset_task_retry(task_id).await?;
        self.state
            .set_task_status(task_id, TaskStatus::Pending, None, None)
            .await?;
        Ok(true)
    }

    pub async fn retry_all_failed(&self) -> Result<Vec<String>> {
        let state = self.state.load().await?;
        let failed: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, r)| r.status == TaskStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        let mut retried = Vec::new();
        for task_id in failed {
            if self.retry_task(&task_id).await? {
                retried.push(task_id);
            }
        }
        Ok(retried)
    }

    pub async fn status(&self) -> Result<OrchestratorStatus> {
        let state = self.state.load().await?;
        let total = self.graph.all_task_ids().count();
        let completed = state.tasks.values().filter(|r| r.status == TaskStatus::Complete).count();
        let failed = state.tasks.values().filter(|r| r.status == TaskStatus::Failed).count();
        let percent = if total == 0 { 100.0 } else { (completed as f64 / total as f64) * 100.0 };

        let workers = state
            .workers
            .iter()
            .map(|(id, w)| {
                (
                    *id,
                    WorkerSummary {
                        status: w.status,
                        current_task: w.current_task.clone(),
                        tasks_completed: w.tasks_completed,
                    },
                )
            })
            .collect();

        Ok(OrchestratorStatus {
            feature: self.feature.clone(),
            running: self.running.load(Ordering::SeqCst),
            paused: state.paused,
            current_level: state.current_level,
            progress: Progress { total, completed, failed, percent },
            workers,
            is_complete: self.finished.load(Ordering::SeqCst),
        })
    }
}

/// Builds the default subprocess launcher. The container backend is
/// constructed by the caller (async, feature-gated) and passed to
/// [`Orchestrator::new`] directly when `launcher_mode` resolves to
/// [`LauncherMode::Container`].
pub fn build_subprocess_launcher(worker_bin: PathBuf, log_dir: Option<PathBuf>) -> Arc<dyn WorkerLauncher> {
    Arc::new(SubprocessLauncher::new(worker_bin, log_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{SpawnResult, WorkerHandle};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    /// A launcher test double: every spawned worker immediately reports
    /// `exit_ok` (default: clean exit) the first time it is polled.
    struct FakeLauncher {
        statuses: DashMap<u32, WorkerStatus>,
        spawns: AtomicU32,
        exit_status: WorkerStatus,
    }

    impl FakeLauncher {
        fn new(exit_status: WorkerStatus) -> Self {
            Self { statuses: DashMap::new(), spawns: AtomicU32::new(0), exit_status }
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn spawn(&self, worker_id: u32, _env: WorkerEnv, _overrides: HashMap<String, String>) -> Result<SpawnResult> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.statuses.insert(worker_id, self.exit_status);
            Ok(SpawnResult {
                success: true,
                worker_id,
                handle: Some(WorkerHandle {
                    worker_id,
                    pid: Some(1000 + worker_id),
                    container_id: None,
                    status: WorkerStatus::Initializing,
                    started_at: Utc::now(),
                    exit_code: None,
                }),
                error: None,
            })
        }

        async fn monitor(&self, worker_id: u32) -> Result<WorkerStatus> {
            Ok(self.statuses.get(&worker_id).map(|s| *s).unwrap_or(WorkerStatus::Stopped))
        }

        async fn terminate(&self, worker_id: u32, _force: bool) -> Result<bool> {
            self.statuses.remove(&worker_id);
            Ok(true)
        }

        async fn get_output(&self, _worker_id: u32, _tail: usize) -> Result<String> {
            Ok(String::new())
        }

        async fn get_handle(&self, _worker_id: u32) -> Result<Option<WorkerHandle>> {
            Ok(None)
        }

        async fn terminate_all(&self, _force: bool) -> Result<HashMap<u32, bool>> {
            Ok(HashMap::new())
        }

        async fn sync_state(&self) -> Result<HashMap<u32, WorkerStatus>> {
            let out: HashMap<u32, WorkerStatus> = self.statuses.iter().map(|e| (*e.key(), *e.value())).collect();
            self.statuses.retain(|_, s| !matches!(s, WorkerStatus::Stopped | WorkerStatus::Crashed));
            Ok(out)
        }
    }

    async fn init_repo(dir: &Path) -> String {
        let run = |args: &[&str]| {
            std::process::Command::new("git").args(args).current_dir(dir).output().unwrap()
        };
        run(&["init", "-q", "-b", "demo"]);
        run(&["config", "user.email", "t@example.com"]);
        run(&["config", "user.name", "t"]);
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
        "demo".to_string()
    }

    fn single_task_graph() -> TaskGraph {
        let json = r#"{
            "feature": "demo", "version": "1",
            "tasks": [{"id": "t1", "title": "A", "level": 1,
                "verification": {"command": "true", "timeout_seconds": 5}}],
            "levels": {"1": ["t1"]}
        }"#;
        TaskGraph::parse_str(json, false).unwrap()
    }

    #[tokio::test]
    async fn one_task_one_worker_success() {
        let repo = tempdir().unwrap();
        let feature = init_repo(repo.path()).await;
        let state_dir = tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            feature,
            ZergConfig::default(),
            single_task_graph(),
            repo.path().to_path_buf(),
            state_dir.path().to_path_buf(),
            repo.path().to_path_buf(),
            repo.path().join("logs"),
            Arc::new(FakeLauncher::new(WorkerStatus::Stopped)),
        );

        orchestrator.start(1, Some(1), false).await.unwrap();

        let status = orchestrator.status().await.unwrap();
        assert!(status.is_complete);
        assert_eq!(status.progress.completed, 1);
        assert_eq!(status.progress.failed, 0);
    }

    #[tokio::test]
    async fn zero_workers_requested_fails_start() {
        let repo = tempdir().unwrap();
        let feature = init_repo(repo.path()).await;
        let state_dir = tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            feature,
            ZergConfig::default(),
            single_task_graph(),
            repo.path().to_path_buf(),
            state_dir.path().to_path_buf(),
            repo.path().to_path_buf(),
            repo.path().join("logs"),
            Arc::new(FakeLauncher::new(WorkerStatus::Stopped)),
        );

        let err = orchestrator.start(0, Some(1), false).await.unwrap_err();
        assert!(matches!(err, ZergError::Other { .. }));
    }

    #[tokio::test]
    async fn dry_run_does_not_spawn() {
        let repo = tempdir().unwrap();
        let feature = init_repo(repo.path()).await;
        let state_dir = tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(WorkerStatus::Stopped));

        let orchestrator = Orchestrator::new(
            feature,
            ZergConfig::default(),
            single_task_graph(),
            repo.path().to_path_buf(),
            state_dir.path().to_path_buf(),
            repo.path().to_path_buf(),
            repo.path().join("logs"),
            launcher.clone(),
        );

        orchestrator.start(1, Some(1), true).await.unwrap();
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_launcher_mode_is_fatal_configuration_error() {
        let repo = tempdir().unwrap();
        let err = resolve_launcher_mode("quantum", repo.path()).await.unwrap_err();
        assert!(matches!(err, ZergError::Config { .. }));
    }

    #[tokio::test]
    async fn worker_crash_requeues_task_without_burning_retry_budget() {
        let repo = tempdir().unwrap();
        let feature = init_repo(repo.path()).await;
        let state_dir = tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            feature,
            ZergConfig::default(),
            single_task_graph(),
            repo.path().to_path_buf(),
            state_dir.path().to_path_buf(),
            repo.path().to_path_buf(),
            repo.path().join("logs"),
            Arc::new(FakeLauncher::new(WorkerStatus::Crashed)),
        );

        orchestrator.start_level(1).await.unwrap();
        orchestrator.spawn_worker(1, 1).await.unwrap();
        orchestrator.tick().await.unwrap();

        let snapshot = orchestrator.state.status_snapshot().await.unwrap();
        let record = snapshot.tasks.get("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(!orchestrator.circuit_breaker.is_open());
    }

    #[tokio::test]
    async fn task_verification_failure_exhausts_retries_then_pauses_for_intervention() {
        let repo = tempdir().unwrap();
        let feature = init_repo(repo.path()).await;
        let state_dir = tempdir().unwrap();

        let json = format!(
            r#"{{
                "feature": "{feature}", "version": "1",
                "tasks": [{{"id": "t1", "title": "A", "level": 1,
                    "verification": {{"command": "false", "timeout_seconds": 5}}}}],
                "levels": {{"1": ["t1"]}}
            }}"#
        );
        let graph = TaskGraph::parse_str(&json, false).unwrap();

        let mut config = ZergConfig::default();
        config.retry.max_attempts = 1;

        let orchestrator = Orchestrator::new(
            feature,
            config,
            graph,
            repo.path().to_path_buf(),
            state_dir.path().to_path_buf(),
            repo.path().to_path_buf(),
            repo.path().join("logs"),
            Arc::new(FakeLauncher::new(WorkerStatus::Stopped)),
        );

        orchestrator.start_level(1).await.unwrap();
        orchestrator.spawn_worker(1, 1).await.unwrap();
        orchestrator.tick().await.unwrap();

        let snapshot = orchestrator.state.status_snapshot().await.unwrap();
        assert_eq!(snapshot.tasks.get("t1").unwrap().status, TaskStatus::Failed);
        assert!(snapshot.paused);
    }

    /// A half-open probe worker that spawns fine but whose task then fails
    /// verification must still clear `probe_in_flight` — the worker didn't
    /// crash, so the breaker shouldn't stay bricked forever.
    #[tokio::test]
    async fn half_open_probe_surviving_task_failure_does_not_brick_breaker() {
        let repo = tempdir().unwrap();
        let feature = init_repo(repo.path()).await;
        let state_dir = tempdir().unwrap();

        let json = format!(
            r#"{{
                "feature": "{feature}", "version": "1",
                "tasks": [{{"id": "t1", "title": "A", "level": 1,
                    "verification": {{"command": "false", "timeout_seconds": 5}}}}],
                "levels": {{"1": ["t1"]}}
            }}"#
        );
        let graph = TaskGraph::parse_str(&json, false).unwrap();

        let mut config = ZergConfig::default();
        config.retry.max_attempts = 5;
        config.error_recovery.circuit_breaker.failure_threshold = 1;
        config.error_recovery.circuit_breaker.cooldown_seconds = 0;

        let orchestrator = Orchestrator::new(
            feature,
            config,
            graph,
            repo.path().to_path_buf(),
            state_dir.path().to_path_buf(),
            repo.path().to_path_buf(),
            repo.path().join("logs"),
            Arc::new(FakeLauncher::new(WorkerStatus::Stopped)),
        );

        // Open the breaker with an unrelated crash, then let cooldown (0s)
        // elapse so the next spawn is the half-open probe.
        orchestrator.circuit_breaker.record_crash();
        assert!(orchestrator.circuit_breaker.is_open());

        orchestrator.start_level(1).await.unwrap();
        orchestrator.spawn_worker(1, 1).await.unwrap();
        assert!(!orchestrator.circuit_breaker.is_open(), "spawn should have consumed the half-open probe");

        // The probe worker exits cleanly but its task fails verification.
        orchestrator.tick().await.unwrap();

        let snapshot = orchestrator.state.status_snapshot().await.unwrap();
        assert_eq!(snapshot.tasks.get("t1").unwrap().status, TaskStatus::Paused);
        assert!(!orchestrator.circuit_breaker.is_open());
        assert!(orchestrator.circuit_breaker.allow_spawn(), "breaker must not be permanently bricked");
    }

    /// A later-level worker already spawned ahead of its level's turn must
    /// have its branch rebased onto the new tip once the earlier level's
    /// merge lands.
    #[tokio::test]
    async fn trailing_branch_of_already_spawned_later_level_worker_is_rebased() {
        let repo = tempdir().unwrap();
        let feature = init_repo(repo.path()).await;
        let state_dir = tempdir().unwrap();

        let json = format!(
            r#"{{
                "feature": "{feature}", "version": "1",
                "tasks": [
                    {{"id": "t1", "title": "A", "level": 1,
                        "verification": {{"command": "true", "timeout_seconds": 5}}}},
                    {{"id": "t2", "title": "B", "level": 2, "dependencies": ["t1"],
                        "verification": {{"command": "true", "timeout_seconds": 5}}}}
                ],
                "levels": {{"1": ["t1"], "2": ["t2"]}}
            }}"#
        );
        let graph = TaskGraph::parse_str(&json, false).unwrap();

        let launcher = Arc::new(FakeLauncher::new(WorkerStatus::Stopped));

        let orchestrator = Orchestrator::new(
            feature.clone(),
            ZergConfig::default(),
            graph,
            repo.path().to_path_buf(),
            state_dir.path().to_path_buf(),
            repo.path().to_path_buf(),
            repo.path().join("logs"),
            launcher.clone(),
        );

        orchestrator.start_level(1).await.unwrap();
        orchestrator.spawn_worker(1, 1).await.unwrap();
        // Speculatively spawn the level-2 worker ahead of level 1 finishing.
        orchestrator.spawn_worker(2, 2).await.unwrap();
        launcher.statuses.insert(2, WorkerStatus::Running);

        orchestrator.tick().await.unwrap();

        let snapshot = orchestrator.state.status_snapshot().await.unwrap();
        assert_eq!(
            snapshot.levels.get(&1).unwrap().status,
            crate::state::LevelRunStatus::Complete
        );

        let rev = |rev: &str| {
            std::process::Command::new("git")
                .args(["rev-parse", rev])
                .current_dir(repo.path())
                .output()
                .unwrap()
                .stdout
        };
        let trailing_branch = WorktreeManager::branch_name(&feature, 2);
        assert_eq!(rev(&feature), rev(&trailing_branch), "trailing branch should be rebased onto the merged tip");
    }
}
