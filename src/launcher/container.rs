//! Container worker launcher: runs each worker inside its own container via
//! the Docker API (`bollard`), matching the teacher's Docker provider.
//!
//! Requires the `container` feature.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use super::{build_environment, SpawnResult, WorkerEnv, WorkerHandle, WorkerLauncher};
use crate::config::{ContainerConfig, SecurityConfig};
use crate::error::{Result, ZergError};
use crate::state::WorkerStatus;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const PROCESS_VERIFY_TIMEOUT: Duration = Duration::from_secs(120);
const LIVENESS_GRACE_PERIOD: Duration = Duration::from_secs(60);
const ALIVE_MARKER: &str = "/tmp/.zerg-alive";

pub struct ContainerLauncher {
    docker: Docker,
    container_config: ContainerConfig,
    security: SecurityConfig,
    credentials_dir: Option<PathBuf>,
    worker_binary_name: String,
    entry_script_name: String,
    started_at: DashMap<u32, chrono::DateTime<Utc>>,
    containers: DashMap<u32, WorkerHandle>,
}

impl ContainerLauncher {
    pub async fn new(
        container_config: ContainerConfig,
        security: SecurityConfig,
        credentials_dir: Option<PathBuf>,
        worker_binary_name: String,
        entry_script_name: String,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ZergError::launcher(0, format!("failed to connect to container runtime: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| ZergError::launcher(0, format!("container runtime unreachable: {e}")))?;
        Ok(Self {
            docker,
            container_config,
            security,
            credentials_dir,
            worker_binary_name,
            entry_script_name,
            started_at: DashMap::new(),
            containers: DashMap::new(),
        })
    }

    fn container_name(worker_id: u32) -> String {
        format!("zerg-worker-{worker_id}")
    }

    async fn inspect_running(&self, name: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(name, None)
            .await
            .map_err(|e| ZergError::launcher(0, format!("inspect failed: {e}")))?;
        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    async fn pgrep(&self, name: &str) -> Result<bool> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec!["pgrep", "-f", &self.worker_binary_name]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ZergError::launcher(0, format!("exec create failed: {e}")))?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ZergError::launcher(0, format!("exec start failed: {e}")))?
        {
            StartExecResults::Attached { mut output, .. } => {
                Ok(output.next().await.is_some())
            }
            StartExecResults::Detached => Ok(false),
        }
    }

    async fn marker_present(&self, name: &str) -> Result<bool> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec!["test", "-f", ALIVE_MARKER]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ZergError::launcher(0, format!("exec create failed: {e}")))?;
        self.docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ZergError::launcher(0, format!("exec start failed: {e}")))?;
        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| ZergError::launcher(0, format!("exec inspect failed: {e}")))?;
        Ok(inspect.exit_code == Some(0))
    }
}

#[async_trait]
impl WorkerLauncher for ContainerLauncher {
    async fn spawn(
        &self,
        worker_id: u32,
        env: WorkerEnv,
        env_overrides: HashMap<String, String>,
    ) -> Result<SpawnResult> {
        let name = Self::container_name(worker_id);
        let container_worktree = env.worktree.clone();
        let host_state_dir = env.state_dir.clone();

        let mut full_env = build_environment(
            &WorkerEnv {
                worktree: PathBuf::from("/workspace"),
                ..env
            },
            &env_overrides,
        );
        full_env.insert("ZERG_GIT_WORKTREE_DIR".to_string(), "/workspace/.git-worktree".to_string());
        full_env.insert("ZERG_GIT_MAIN_DIR".to_string(), "/repo/.git".to_string());
        full_env.insert("ZERG_STATE_DIR".to_string(), "/workspace/.zerg-state".to_string());

        let env_vec: Vec<String> = full_env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        // The worktree's metadata directory under `.git/worktrees/<name>` is
        // named after the worktree path's basename (see `WorktreeManager`),
        // i.e. `worker-<id>`.
        let worktree_git_dir = format!("{}/.git/worktrees/worker-{worker_id}", full_env["ZERG_REPO_PATH"]);

        let mut mounts = vec![
            Mount {
                target: Some("/workspace".to_string()),
                source: Some(container_worktree.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            },
            Mount {
                target: Some("/repo/.git".to_string()),
                source: Some(full_env["ZERG_REPO_PATH"].clone() + "/.git"),
                typ: Some(MountTypeEnum::BIND),
                // The worker needs write access to the main repo's `.git` to
                // create commits on its worktree's branch.
                ..Default::default()
            },
            Mount {
                target: Some("/workspace/.git-worktree".to_string()),
                source: Some(worktree_git_dir),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            },
            Mount {
                target: Some("/workspace/.zerg-state".to_string()),
                source: Some(host_state_dir.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            },
        ];
        if let Some(creds) = &self.credentials_dir {
            mounts.push(Mount {
                target: Some("/home/worker/.config/zerg-credentials".to_string()),
                source: Some(creds.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let (uid, gid) = (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw());

        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: parse_memory_limit(&self.container_config.memory_limit),
            nano_cpus: parse_cpu_limit(&self.container_config.cpu_limit),
            network_mode: Some(self.container_config.network.clone()),
            readonly_rootfs: Some(self.security.read_only_root),
            security_opt: self
                .security
                .no_new_privileges
                .then(|| vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        let entry_cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "/workspace/{} ; touch {} ; trap 'rm -f {}' EXIT ; sleep infinity",
                self.entry_script_name, ALIVE_MARKER, ALIVE_MARKER
            ),
        ];

        let config = Config {
            image: Some(self.container_config.image_name.clone()),
            env: Some(env_vec),
            cmd: Some(entry_cmd),
            user: Some(format!("{uid}:{gid}")),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_result = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await;

        let container_id = match create_result {
            Ok(r) => r.id,
            Err(e) => {
                warn!(worker_id, error = %e, "failed to create container");
                return Ok(SpawnResult {
                    success: false,
                    worker_id,
                    handle: None,
                    error: Some(e.to_string()),
                });
            }
        };

        if let Err(e) = self.docker.start_container::<String>(&name, None).await {
            warn!(worker_id, error = %e, "failed to start container");
            return Ok(SpawnResult {
                success: false,
                worker_id,
                handle: None,
                error: Some(e.to_string()),
            });
        }

        // Readiness probe: container running within bound, then worker
        // process present within a longer bound (covers dependency install).
        let deadline = Instant::now() + READY_TIMEOUT;
        let mut running = false;
        while Instant::now() < deadline {
            if self.inspect_running(&name).await.unwrap_or(false) {
                running = true;
                break;
            }
            sleep(Duration::from_millis(250)).await;
        }
        if !running {
            self.docker.remove_container(&name, None).await.ok();
            return Ok(SpawnResult {
                success: false,
                worker_id,
                handle: None,
                error: Some("container did not reach Running within timeout".to_string()),
            });
        }

        let process_deadline = Instant::now() + PROCESS_VERIFY_TIMEOUT;
        let mut process_found = false;
        while Instant::now() < process_deadline {
            if self.pgrep(&name).await.unwrap_or(false) {
                process_found = true;
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
        if !process_found {
            self.docker
                .remove_container(&name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await
                .ok();
            return Ok(SpawnResult {
                success: false,
                worker_id,
                handle: None,
                error: Some("worker process did not appear in container".to_string()),
            });
        }

        let handle = WorkerHandle {
            worker_id,
            pid: None,
            container_id: Some(container_id.clone()),
            status: WorkerStatus::Ready,
            started_at: Utc::now(),
            exit_code: None,
        };
        self.started_at.insert(worker_id, Utc::now());
        self.containers.insert(worker_id, handle.clone());

        info!(worker_id, container_id, "container worker ready");
        Ok(SpawnResult {
            success: true,
            worker_id,
            handle: Some(handle),
            error: None,
        })
    }

    async fn monitor(&self, worker_id: u32) -> Result<WorkerStatus> {
        let name = Self::container_name(worker_id);
        if !self.inspect_running(&name).await.unwrap_or(false) {
            return Ok(WorkerStatus::Stopped);
        }

        // Liveness probe: only checked past the grace period, because the
        // entry script keeps `sleep infinity` running after worker exit so
        // operators can inspect the container.
        let started = self
            .started_at
            .get(&worker_id)
            .map(|t| *t)
            .unwrap_or_else(Utc::now);
        if Utc::now() - started > chrono::Duration::from_std(LIVENESS_GRACE_PERIOD).unwrap() {
            if !self.marker_present(&name).await.unwrap_or(true) {
                return Ok(WorkerStatus::Stopped);
            }
        }
        Ok(WorkerStatus::Running)
    }

    async fn terminate(&self, worker_id: u32, force: bool) -> Result<bool> {
        let name = Self::container_name(worker_id);
        if force {
            self.docker.kill_container::<String>(&name, None).await.ok();
        } else {
            self.docker
                .stop_container(&name, Some(StopContainerOptions { t: 10 }))
                .await
                .ok();
        }
        self.docker
            .remove_container(&name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
            .ok();
        self.containers.remove(&worker_id);
        self.started_at.remove(&worker_id);
        Ok(true)
    }

    async fn get_output(&self, worker_id: u32, tail: usize) -> Result<String> {
        let name = Self::container_name(worker_id);
        let mut stream = self.docker.logs(
            &name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            if let Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) = chunk {
                out.push_str(&String::from_utf8_lossy(&message));
            }
        }
        Ok(out)
    }

    async fn get_handle(&self, worker_id: u32) -> Result<Option<WorkerHandle>> {
        Ok(self.containers.get(&worker_id).map(|e| e.clone()))
    }

    async fn terminate_all(&self, force: bool) -> Result<HashMap<u32, bool>> {
        let ids: Vec<u32> = self.containers.iter().map(|e| *e.key()).collect();
        let mut results = HashMap::new();
        for id in ids {
            results.insert(id, self.terminate(id, force).await?);
        }
        Ok(results)
    }

    async fn sync_state(&self) -> Result<HashMap<u32, WorkerStatus>> {
        let ids: Vec<u32> = self.containers.iter().map(|e| *e.key()).collect();
        let mut statuses = HashMap::new();
        for id in ids {
            let status = self.monitor(id).await?;
            statuses.insert(id, status);
            if matches!(status, WorkerStatus::Stopped | WorkerStatus::Crashed) {
                self.containers.remove(&id);
            }
        }
        Ok(statuses)
    }
}

fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let (num, mult) = if let Some(n) = limit.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = limit.strip_suffix('m') {
        (n, 1024 * 1024)
    } else {
        (limit.as_str(), 1)
    };
    num.parse::<i64>().ok().map(|n| n * mult)
}

fn parse_cpu_limit(limit: &str) -> Option<i64> {
    limit.parse::<f64>().ok().map(|cpus| (cpus * 1_000_000_000.0) as i64)
}
