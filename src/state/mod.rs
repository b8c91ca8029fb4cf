//! Durable state store: the single source of truth for a run, shared by the
//! orchestrator process and all worker instances.
//!
//! Every mutation reloads the on-disk document before applying the change and
//! immediately saves it back (the "reload-before-write" pattern from the
//! design notes) so sibling processes don't clobber each other's writes for
//! disjoint fields. An in-process `tokio::sync::Mutex` serializes mutations
//! from this process; it is held for the full reload-mutate-save sequence and
//! mutation closures must not call back into the store, so the lock is never
//! reentered.

mod model;

pub use model::*;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, ZergError};

pub struct StateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(state_dir: &Path, feature: &str) -> Self {
        Self {
            path: state_dir.join(format!("{feature}.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the document from disk, creating an empty one (in memory only,
    /// not yet persisted) if absent. A present-but-malformed document is a
    /// fatal `ZergError::State` — the caller must intervene, never silently
    /// reinitialize.
    pub async fn load(&self) -> Result<RunState> {
        if !self.path.exists() {
            let feature = self
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            return Ok(RunState::new(feature));
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ZergError::state(format!("failed to read state file: {e}")))?;

        serde_json::from_str(&contents).map_err(|e| {
            ZergError::state(format!(
                "state document at {} is corrupted or truncated: {e}",
                self.path.display()
            ))
        })
    }

    /// Atomically overwrites the document: write to a temp file in the same
    /// directory, fsync it, rename over the target, then fsync the directory.
    pub async fn save(&self, state: &RunState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| ZergError::state("state path has no parent directory"))?;
        tokio::fs::create_dir_all(dir).await?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| ZergError::state(format!("failed to create temp state file: {e}")))?;
        let json = serde_json::to_string_pretty(state)?;
        {
            use std::io::Write;
            tmp.write_all(json.as_bytes())
                .map_err(|e| ZergError::state(format!("failed to write temp state file: {e}")))?;
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&self.path)
            .map_err(|e| ZergError::state(format!("failed to rename state file into place: {e}")))?;

        if let Ok(dir_file) = std::fs::File::open(dir) {
            let _ = dir_file.sync_all();
        }
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    /// Reload-mutate-save under the in-process lock. `f` must be synchronous
    /// and must not call back into the store.
    async fn mutate<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RunState) -> Result<T>,
    {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        let result = f(&mut state)?;
        self.save(&state).await?;
        Ok(result)
    }

    pub async fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        worker_id: Option<u32>,
        error: Option<String>,
    ) -> Result<()> {
        self.mutate(|state| {
            let record = state.tasks.entry(task_id.to_string()).or_default();
            record.status = status;
            if worker_id.is_some() {
                record.worker_id = worker_id;
            }
            if error.is_some() {
                record.error = error.clone();
            }
            state.append_event_inner(
                "task_status_changed",
                serde_json::json!({"task_id": task_id, "status": status, "worker_id": worker_id, "error": error}),
            );
            Ok(())
        })
        .await
    }

    /// Atomic CAS: claims the task iff its current status is `Pending`.
    pub async fn claim_task(&self, task_id: &str, worker_id: u32) -> Result<bool> {
        self.mutate(|state| {
            let record = state.tasks.entry(task_id.to_string()).or_default();
            if record.status == TaskStatus::Pending {
                record.status = TaskStatus::Claimed;
                record.worker_id = Some(worker_id);
                state.append_event_inner(
                    "task_claimed",
                    serde_json::json!({"task_id": task_id, "worker_id": worker_id}),
                );
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .await
    }

    /// Downgrades a task back to `Pending` only if `worker_id` currently
    /// holds it.
    pub async fn release_task(&self, task_id: &str, worker_id: u32) -> Result<()> {
        self.mutate(|state| {
            if let Some(record) = state.tasks.get_mut(task_id) {
                if record.worker_id == Some(worker_id) {
                    record.status = TaskStatus::Pending;
                    record.worker_id = None;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn set_worker_state(&self, worker: WorkerState) -> Result<()> {
        self.mutate(|state| {
            state.workers.insert(worker.worker_id, worker);
            Ok(())
        })
        .await
    }

    pub async fn remove_worker(&self, worker_id: u32) -> Result<()> {
        self.mutate(|state| {
            state.workers.remove(&worker_id);
            Ok(())
        })
        .await
    }

    pub async fn get_worker(&self, worker_id: u32) -> Result<Option<WorkerState>> {
        let state = self.load().await?;
        Ok(state.workers.get(&worker_id).cloned())
    }

    pub async fn set_worker_ready(&self, worker_id: u32) -> Result<()> {
        self.mutate(|state| {
            if let Some(w) = state.workers.get_mut(&worker_id) {
                w.status = WorkerStatus::Ready;
                w.ready_at = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    pub async fn wait_for_workers_ready(
        &self,
        worker_ids: &[u32],
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.load().await?;
            let all_ready = worker_ids.iter().all(|id| {
                state
                    .workers
                    .get(id)
                    .map(|w| matches!(w.status, WorkerStatus::Ready))
                    .unwrap_or(false)
            });
            if all_ready {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!("timed out waiting for workers to become ready");
                return Ok(false);
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn set_level_status(
        &self,
        level: u32,
        status: LevelRunStatus,
        merge_commit: Option<String>,
    ) -> Result<()> {
        self.mutate(|state| {
            let entry = state.levels.entry(level).or_default();
            entry.status = status;
            match status {
                LevelRunStatus::Running if entry.started_at.is_none() => {
                    entry.started_at = Some(Utc::now());
                }
                LevelRunStatus::Complete => {
                    entry.completed_at = Some(Utc::now());
                }
                _ => {}
            }
            if merge_commit.is_some() {
                entry.merge_commit = merge_commit;
            }
            Ok(())
        })
        .await
    }

    pub async fn set_level_merge_status(
        &self,
        level: u32,
        merge_status: MergeStatus,
        details: Option<String>,
    ) -> Result<()> {
        self.mutate(|state| {
            let entry = state.levels.entry(level).or_default();
            entry.merge_status = merge_status;
            if merge_status == MergeStatus::Complete {
                entry.merge_completed_at = Some(Utc::now());
            }
            if details.is_some() {
                entry.merge_detail = details;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_level_merge_status(&self, level: u32) -> Result<MergeStatus> {
        let state = self.load().await?;
        Ok(state
            .levels
            .get(&level)
            .map(|l| l.merge_status)
            .unwrap_or(MergeStatus::Pending))
    }

    pub async fn get_task_retry_count(&self, task_id: &str) -> Result<u32> {
        let state = self.load().await?;
        Ok(state
            .tasks
            .get(task_id)
            .map(|r| r.retry_count)
            .unwrap_or(0))
    }

    pub async fn increment_task_retry(&self, task_id: &str) -> Result<u32> {
        self.mutate(|state| {
            let record = state.tasks.entry(task_id.to_string()).or_default();
            record.retry_count += 1;
            record.last_retry_at = Some(Utc::now());
            Ok(record.retry_count)
        })
        .await
    }

    pub async fn reset_task_retry(&self, task_id: &str) -> Result<()> {
        self.mutate(|state| {
            let record = state.tasks.entry(task_id.to_string()).or_default();
            record.retry_count = 0;
            record.next_retry_at = None;
            Ok(())
        })
        .await
    }

    pub async fn set_task_next_retry_at(
        &self,
        task_id: &str,
        when: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|state| {
            let record = state.tasks.entry(task_id.to_string()).or_default();
            record.next_retry_at = Some(when);
            Ok(())
        })
        .await
    }

    /// Transitions a task whose backoff has elapsed back to `pending` and
    /// clears `next_retry_at`. No-op if the task is not currently `paused`
    /// (i.e. it was already requeued or resolved by another writer).
    pub async fn requeue_retry_ready_task(&self, task_id: &str) -> Result<()> {
        self.mutate(|state| {
            if let Some(record) = state.tasks.get_mut(task_id) {
                if record.status == TaskStatus::Paused {
                    record.status = TaskStatus::Pending;
                }
                record.next_retry_at = None;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_tasks_ready_for_retry(&self, now: chrono::DateTime<Utc>) -> Result<Vec<String>> {
        let state = self.load().await?;
        Ok(state
            .tasks
            .iter()
            .filter(|(_, r)| r.next_retry_at.map(|t| t <= now).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect())
    }

    pub async fn append_event(&self, event_name: &str, payload: serde_json::Value) -> Result<()> {
        self.mutate(|state| {
            state.append_event_inner(event_name, payload);
            Ok(())
        })
        .await
    }

    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.mutate(|state| {
            state.paused = paused;
            Ok(())
        })
        .await
    }

    pub async fn set_error(&self, message: Option<String>) -> Result<()> {
        self.mutate(|state| {
            state.error = message;
            Ok(())
        })
        .await
    }

    pub async fn set_current_level(&self, level: u32) -> Result<()> {
        self.mutate(|state| {
            if level < state.current_level {
                return Err(ZergError::state(format!(
                    "level regression: current {} -> requested {}",
                    state.current_level, level
                )));
            }
            state.current_level = level;
            Ok(())
        })
        .await
    }

    /// Writes a human-readable snapshot of the state document. A convenience
    /// for operators; not on the critical path.
    pub async fn generate_state_md(&self, out_dir: &Path) -> Result<PathBuf> {
        let state = self.load().await?;
        let mut md = String::new();
        md.push_str(&format!("# Run: {}\n\n", state.feature));
        md.push_str(&format!("- current_level: {}\n", state.current_level));
        md.push_str(&format!("- paused: {}\n", state.paused));
        md.push_str(&format!("- started_at: {}\n\n", state.started_at));
        md.push_str("## Tasks\n\n");
        for (id, record) in &state.tasks {
            md.push_str(&format!("- {id}: {:?} (retries={})\n", record.status, record.retry_count));
        }
        md.push_str("\n## Workers\n\n");
        for (id, worker) in &state.workers {
            md.push_str(&format!("- worker-{id}: {:?}\n", worker.status));
        }
        tokio::fs::create_dir_all(out_dir).await?;
        let path = out_dir.join(format!("{}.state.md", state.feature));
        tokio::fs::write(&path, md).await?;
        debug!("wrote state snapshot to {}", path.display());
        Ok(path)
    }

    pub async fn status_snapshot(&self) -> Result<RunState> {
        self.load().await
    }
}

impl RunState {
    pub fn new(feature: String) -> Self {
        Self {
            feature,
            started_at: Utc::now(),
            current_level: 0,
            tasks: Default::default(),
            workers: Default::default(),
            levels: Default::default(),
            execution_log: Vec::new(),
            paused: false,
            error: None,
        }
    }

    fn append_event_inner(&mut self, event: &str, payload: serde_json::Value) {
        info!(event, "execution_log append");
        self.execution_log.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            event: event.to_string(),
            payload,
        });
    }
}
