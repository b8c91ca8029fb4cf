use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use crate::task_graph::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Running,
    Idle,
    Checkpointing,
    Stopping,
    Stopped,
    Crashed,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelRunStatus {
    Pending,
    Running,
    Complete,
}

impl Default for LevelRunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Waiting,
    Collecting,
    Merging,
    Validating,
    Rebasing,
    Complete,
    Conflict,
    Failed,
}

impl Default for MergeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub worker_id: Option<u32>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: u32,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub port: Option<u16>,
    pub launcher_handle: Option<String>,
    pub worktree_path: std::path::PathBuf,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub last_task_completed_at: Option<DateTime<Utc>>,
    pub tasks_completed: u32,
    pub context_usage: f64,
}

impl WorkerState {
    pub fn new(worker_id: u32, worktree_path: std::path::PathBuf, branch: String) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Initializing,
            current_task: None,
            port: None,
            launcher_handle: None,
            worktree_path,
            branch,
            started_at: Utc::now(),
            ready_at: None,
            last_task_completed_at: None,
            tasks_completed: 0,
            context_usage: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelState {
    pub status: LevelRunStatus,
    pub merge_status: MergeStatus,
    pub merge_commit: Option<String>,
    pub merge_detail: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merge_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub feature: String,
    pub started_at: DateTime<Utc>,
    pub current_level: u32,
    pub tasks: HashMap<String, TaskRecord>,
    pub workers: HashMap<u32, WorkerState>,
    pub levels: HashMap<u32, LevelState>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub paused: bool,
    pub error: Option<String>,
}
