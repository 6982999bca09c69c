//! Core runner trait and types.

use async_trait::async_trait;
use ferrule_core::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn from_exit_code(exit_code: i32, duration_ms: u64) -> Self {
        Self {
            exit_code,
            success: exit_code == 0,
            duration_ms,
        }
    }
}

/// Everything a runner needs to execute one step.
///
/// `env` is the complete environment of the step, secrets included; runners
/// must not add the orchestrator's own environment on top of it beyond their
/// configured pass-through list.
#[derive(Clone)]
pub struct StepContext {
    pub step_name: String,
    pub command: String,
    pub shell: String,
    pub workspace: PathBuf,
    pub working_directory: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl StepContext {
    /// Directory the command runs in.
    pub fn cwd(&self) -> PathBuf {
        match &self.working_directory {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        }
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // env may carry secrets; only list the names.
        let mut keys: Vec<&String> = self.env.keys().collect();
        keys.sort();
        f.debug_struct("StepContext")
            .field("step_name", &self.step_name)
            .field("command", &self.command)
            .field("shell", &self.shell)
            .field("workspace", &self.workspace)
            .field("working_directory", &self.working_directory)
            .field("env", &keys)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Trait for step execution.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a step, streaming output to the provided channel.
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult>;
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Used when a step sets no timeout of its own.
    pub default_timeout: Option<Duration>,
    /// Host variables copied into every step environment.
    pub passthrough_env: Vec<String>,
}

pub fn default_passthrough_env() -> Vec<String> {
    [
        "PATH",
        "HOME",
        "USER",
        "LANG",
        "TERM",
        "TMPDIR",
        "CARGO_HOME",
        "RUSTUP_HOME",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(3600)),
            passthrough_env: default_passthrough_env(),
        }
    }
}
