//! Verification Executor: runs a task's verification command with a timeout
//! and reports its exit status. Interprets nothing about the task itself.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs `command` from `cwd` via the platform shell, killing the process
/// group on timeout. An empty command auto-passes.
pub async fn verify(command: &str, cwd: &Path, timeout_duration: Duration) -> VerificationResult {
    if command.trim().is_empty() {
        return VerificationResult {
            success: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        };
    }

    let start = std::time::Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return VerificationResult {
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to spawn verification command: {e}"),
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }
    };

    let pid = child.id();

    match timeout(timeout_duration, child.wait_with_output()).await {
        Ok(Ok(output)) => VerificationResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Ok(Err(e)) => VerificationResult {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("verification command failed: {e}"),
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Err(_) => {
            warn!(command, "verification command timed out, killing process group");
            if let Some(pid) = pid {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                #[cfg(not(unix))]
                let _ = pid;
            }
            VerificationResult {
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: "verification command timed out".to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
    }
}

/// Calls `verify` up to `max_retries + 1` times, returning the first success
/// or the last failure.
pub async fn verify_with_retry(
    command: &str,
    max_retries: u32,
    timeout_duration: Duration,
    cwd: &Path,
) -> VerificationResult {
    let mut last = verify(command, cwd, timeout_duration).await;
    for _ in 0..max_retries {
        if last.success {
            return last;
        }
        last = verify(command, cwd, timeout_duration).await;
    }
    last
}
