//! Subprocess worker launcher: spawns the worker as a child process of the
//! orchestrator on the host.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use super::{build_environment, status_from_exit_code, SpawnResult, WorkerEnv, WorkerHandle, WorkerLauncher};
use crate::error::{Result, ZergError};
use crate::state::WorkerStatus;

struct TrackedChild {
    child: Child,
    handle: WorkerHandle,
}

pub struct SubprocessLauncher {
    worker_bin: PathBuf,
    log_dir: Option<PathBuf>,
    children: DashMap<u32, TrackedChild>,
}

impl SubprocessLauncher {
    pub fn new(worker_bin: PathBuf, log_dir: Option<PathBuf>) -> Self {
        Self {
            worker_bin,
            log_dir,
            children: DashMap::new(),
        }
    }

    async fn log_stdio(&self, worker_id: u32) -> Result<(Stdio, Stdio)> {
        let Some(log_dir) = &self.log_dir else {
            return Ok((Stdio::piped(), Stdio::piped()));
        };
        tokio::fs::create_dir_all(log_dir).await?;
        let out = std::fs::File::create(log_dir.join(format!("worker-{worker_id}.stdout.log")))?;
        let err = std::fs::File::create(log_dir.join(format!("worker-{worker_id}.stderr.log")))?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
    async fn spawn(
        &self,
        worker_id: u32,
        env: WorkerEnv,
        env_overrides: HashMap<String, String>,
    ) -> Result<SpawnResult> {
        let worktree = env.worktree.clone();
        let full_env = build_environment(&env, &env_overrides);
        let (stdout, stderr) = self.log_stdio(worker_id).await?;

        let mut cmd = Command::new(&self.worker_bin);
        cmd.current_dir(&worktree)
            .envs(full_env)
            .stdout(stdout)
            .stderr(stderr)
            .stdin(Stdio::null());

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                let handle = WorkerHandle {
                    worker_id,
                    pid,
                    container_id: None,
                    status: WorkerStatus::Initializing,
                    started_at: Utc::now(),
                    exit_code: None,
                };
                info!(worker_id, pid, "spawned subprocess worker");
                self.children.insert(worker_id, TrackedChild { child, handle: handle.clone() });
                Ok(SpawnResult {
                    success: true,
                    worker_id,
                    handle: Some(handle),
                    error: None,
                })
            }
            Err(e) => {
                warn!(worker_id, error = %e, "failed to spawn subprocess worker");
                Ok(SpawnResult {
                    success: false,
                    worker_id,
                    handle: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn monitor(&self, worker_id: u32) -> Result<WorkerStatus> {
        let Some(mut entry) = self.children.get_mut(&worker_id) else {
            return Ok(WorkerStatus::Stopped);
        };
        match entry.child.try_wait() {
            Ok(Some(exit_status)) => {
                let code = exit_status.code().unwrap_or(-1);
                let status = status_from_exit_code(code);
                entry.handle.status = status;
                entry.handle.exit_code = Some(code);
                Ok(status)
            }
            Ok(None) => Ok(WorkerStatus::Running),
            Err(e) => Err(ZergError::launcher(worker_id, format!("failed to poll process: {e}"))),
        }
    }

    async fn terminate(&self, worker_id: u32, force: bool) -> Result<bool> {
        let Some(mut entry) = self.children.get_mut(&worker_id) else {
            return Ok(false);
        };

        if force {
            entry.child.kill().await.ok();
        } else {
            #[cfg(unix)]
            if let Some(pid) = entry.child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }

            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                match entry.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => sleep(Duration::from_millis(100)).await,
                    Ok(None) => {
                        entry.child.kill().await.ok();
                        break;
                    }
                    Err(_) => break,
                }
            }
        }

        drop(entry);
        self.children.remove(&worker_id);
        info!(worker_id, force, "terminated subprocess worker");
        Ok(true)
    }

    async fn get_output(&self, worker_id: u32, tail: usize) -> Result<String> {
        let Some(log_dir) = &self.log_dir else {
            return Ok(String::new());
        };
        let path = log_dir.join(format!("worker-{worker_id}.stdout.log"));
        let contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }

    async fn get_handle(&self, worker_id: u32) -> Result<Option<WorkerHandle>> {
        Ok(self.children.get(&worker_id).map(|e| e.handle.clone()))
    }

    async fn terminate_all(&self, force: bool) -> Result<HashMap<u32, bool>> {
        let ids: Vec<u32> = self.children.iter().map(|e| *e.key()).collect();
        let mut results = HashMap::new();
        for id in ids {
            results.insert(id, self.terminate(id, force).await?);
        }
        Ok(results)
    }

    async fn sync_state(&self) -> Result<HashMap<u32, WorkerStatus>> {
        let ids: Vec<u32> = self.children.iter().map(|e| *e.key()).collect();
        let mut statuses = HashMap::new();
        for id in ids {
            let status = self.monitor(id).await?;
            statuses.insert(id, status);
            if matches!(status, WorkerStatus::Stopped | WorkerStatus::Crashed) {
                self.children.remove(&id);
            }
        }
        Ok(statuses)
    }
}
