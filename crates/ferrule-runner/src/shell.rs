//! Shell-based step execution on the host.

use crate::runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use ferrule_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Shell runner for executing commands on the host.
///
/// The child starts from an empty environment: only the configured
/// pass-through variables and the step's own environment are visible.
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, ctx: &StepContext) -> Command {
        let mut command = Command::new(&ctx.shell);
        if matches!(ctx.shell.as_str(), "bash" | "sh") {
            command.arg("-e");
        }
        command.arg("-c").arg(&ctx.command);

        command.env_clear();
        for key in &self.config.passthrough_env {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        command
            .envs(&ctx.env)
            .current_dir(ctx.cwd())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches background children.
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

/// Kill the step's whole process group, then the shell itself.
async fn terminate(child: &mut Child, group: Option<u32>) {
    if let Some(pgid) = group {
        kill_group(pgid);
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a group that is already gone yields ESRCH.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

fn stream_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0u32;

        while let Ok(Some(line)) = lines.next_line().await {
            line_number += 1;
            let output = OutputLine {
                stream,
                content: line,
                line_number,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(output).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();

        info!(step = %ctx.step_name, cwd = %ctx.cwd().display(), "Executing shell command");

        let mut child = self
            .build_command(ctx)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn {}: {}", ctx.shell, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

        let group = child.id();
        let mut stdout_handle = stream_lines(stdout, OutputStream::Stdout, output_tx.clone());
        let mut stderr_handle = stream_lines(stderr, OutputStream::Stderr, output_tx);

        // The limit covers draining the pipes too: a background process that
        // inherited them keeps the step open after the shell exits.
        let completion = async {
            let status = child.wait().await;
            let _ = (&mut stdout_handle).await;
            let _ = (&mut stderr_handle).await;
            status
        };

        let limit = ctx.timeout.or(self.config.default_timeout);
        let wait_result = match limit {
            Some(limit) => match timeout(limit, completion).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(step = %ctx.step_name, timeout_ms = limit.as_millis() as u64, "Command timed out, killing process group");
                    terminate(&mut child, group).await;
                    stdout_handle.abort();
                    stderr_handle.abort();
                    return Err(Error::StepTimeout { limit });
                }
            },
            None => completion.await,
        };

        let status = wait_result?;
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(step = %ctx.step_name, exit_code, duration_ms, "Command completed");

        Ok(StepResult::from_exit_code(exit_code, duration_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn make_ctx(cmd: &str) -> StepContext {
        StepContext {
            step_name: "test".to_string(),
            command: cmd.to_string(),
            shell: "sh".to_string(),
            workspace: std::env::temp_dir(),
            working_directory: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<OutputLine>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.content);
        }
        lines
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let runner = ShellRunner::default();
        let (tx, rx) = mpsc::channel(100);

        let result = runner.execute(&make_ctx("echo hello"), tx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(collect(rx).await, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let runner = ShellRunner::default();
        let (tx, _rx) = mpsc::channel(100);

        let result = runner.execute(&make_ctx("exit 3"), tx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_step_env_is_visible() {
        let runner = ShellRunner::default();
        let (tx, rx) = mpsc::channel(100);

        let mut ctx = make_ctx("echo \"$GREETING\"");
        ctx.env.insert("GREETING".to_string(), "hi there".to_string());

        let result = runner.execute(&ctx, tx).await.unwrap();
        assert!(result.success);
        assert_eq!(collect(rx).await, vec!["hi there".to_string()]);
    }

    #[tokio::test]
    async fn test_host_env_is_not_inherited() {
        let runner = ShellRunner::new(RunnerConfig {
            default_timeout: None,
            passthrough_env: vec!["PATH".to_string()],
        });
        let (tx, rx) = mpsc::channel(100);

        let ctx = make_ctx("echo \"${CARGO_MANIFEST_DIR:-absent}\"");
        let result = runner.execute(&ctx, tx).await.unwrap();
        assert!(result.success);
        assert_eq!(collect(rx).await, vec!["absent".to_string()]);
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("marker.txt"), "x").unwrap();

        let runner = ShellRunner::default();
        let (tx, rx) = mpsc::channel(100);

        let mut ctx = make_ctx("ls");
        ctx.workspace = PathBuf::from(dir.path());
        ctx.working_directory = Some("sub".to_string());

        runner.execute(&ctx, tx).await.unwrap();
        assert_eq!(collect(rx).await, vec!["marker.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = ShellRunner::default();
        let (tx, _rx) = mpsc::channel(100);

        let mut ctx = make_ctx("sleep 5");
        ctx.timeout = Some(Duration::from_millis(100));

        let err = runner.execute(&ctx, tx).await.unwrap_err();
        assert!(matches!(err, Error::StepTimeout { limit } if limit == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_timeout_covers_background_children() {
        let runner = ShellRunner::default();
        let (tx, rx) = mpsc::channel(100);

        let mut ctx = make_ctx("sleep 6 & echo started");
        ctx.timeout = Some(Duration::from_millis(500));

        let start = std::time::Instant::now();
        let err = runner.execute(&ctx, tx).await.unwrap_err();
        assert!(matches!(err, Error::StepTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
        assert_eq!(collect(rx).await, vec!["started".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_shell_is_error() {
        let runner = ShellRunner::default();
        let (tx, _rx) = mpsc::channel(100);

        let mut ctx = make_ctx("true");
        ctx.shell = "definitely-not-a-shell".to_string();

        assert!(runner.execute(&ctx, tx).await.is_err());
    }
}
