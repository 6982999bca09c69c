//! Shared helpers for scheduler integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ferrule_core::{Error, Result};
use ferrule_core::pipeline::PipelineDefinition;
use ferrule_runner::{OutputLine, OutputStream, StepContext, StepResult, StepRunner};
use ferrule_secrets::{FileProvider, SecretManager, SecretManagerConfig, SecretScope};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Barrier, mpsc};

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,ferrule_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A step as the runner saw it.
#[derive(Debug, Clone)]
pub struct RecordedStep {
    pub step: String,
    pub command: String,
    pub env: HashMap<String, String>,
}

/// Step runner that never spawns processes.
///
/// Every command exits 0 unless scripted otherwise.
#[derive(Default)]
pub struct ScriptedRunner {
    exit_codes: HashMap<String, i32>,
    outputs: HashMap<String, Vec<String>>,
    panics: HashSet<String>,
    timeouts: HashSet<String>,
    errors: HashMap<String, String>,
    rendezvous: Option<(HashSet<String>, Arc<Barrier>)>,
    calls: Mutex<Vec<RecordedStep>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, command: &str, exit_code: i32) -> Self {
        self.exit_codes.insert(command.to_string(), exit_code);
        self
    }

    pub fn output(mut self, command: &str, lines: &[&str]) -> Self {
        self.outputs.insert(
            command.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    /// The command runs past its step timeout.
    pub fn time_out(mut self, command: &str) -> Self {
        self.timeouts.insert(command.to_string());
        self
    }

    /// The runner itself fails with `message` instead of reporting an exit code.
    pub fn runner_error(mut self, command: &str, message: &str) -> Self {
        self.errors.insert(command.to_string(), message.to_string());
        self
    }

    pub fn panic_on(mut self, command: &str) -> Self {
        self.panics.insert(command.to_string());
        self
    }

    /// The given commands block until all of them are running at once.
    pub fn rendezvous(mut self, commands: &[&str]) -> Self {
        let barrier = Arc::new(Barrier::new(commands.len()));
        let commands = commands.iter().map(|c| c.to_string()).collect();
        self.rendezvous = Some((commands, barrier));
        self
    }

    pub fn calls(&self) -> Vec<RecordedStep> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Environment seen by the first call of `command`.
    pub fn env_of(&self, command: &str) -> HashMap<String, String> {
        self.calls()
            .into_iter()
            .find(|c| c.command == command)
            .map(|c| c.env)
            .unwrap_or_else(|| panic!("command `{command}` never ran"))
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        self.calls.lock().unwrap().push(RecordedStep {
            step: ctx.step_name.clone(),
            command: ctx.command.clone(),
            env: ctx.env.clone(),
        });

        if self.panics.contains(&ctx.command) {
            panic!("scripted panic in `{}`", ctx.command);
        }

        if let Some((commands, barrier)) = &self.rendezvous
            && commands.contains(&ctx.command)
        {
            barrier.wait().await;
        }

        if let Some(lines) = self.outputs.get(&ctx.command) {
            for (i, line) in lines.iter().enumerate() {
                let _ = output_tx
                    .send(OutputLine {
                        stream: OutputStream::Stdout,
                        content: line.clone(),
                        line_number: i as u32 + 1,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        }

        if self.timeouts.contains(&ctx.command) {
            return Err(Error::StepTimeout {
                limit: ctx.timeout.unwrap_or_default(),
            });
        }
        if let Some(message) = self.errors.get(&ctx.command) {
            return Err(Error::Internal(message.clone()));
        }

        let exit_code = self.exit_codes.get(&ctx.command).copied().unwrap_or(0);
        Ok(StepResult::from_exit_code(exit_code, 0))
    }
}

/// Secret scope backed by an in-memory store.
pub fn secret_scope(secrets: &[(&str, &str)]) -> SecretScope {
    let map = secrets
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut manager = SecretManager::new(SecretManagerConfig {
        default_provider: "memory".to_string(),
        ..Default::default()
    });
    manager.register_provider("memory", Arc::new(FileProvider::from_map(map)));
    SecretScope::new(Arc::new(manager))
}

pub fn pipeline(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::from_yaml(yaml).expect("valid pipeline")
}

/// A, B independent; C needs both; D needs C and only runs on `v*` tags.
pub const DIAMOND: &str = r#"
name: diamond
jobs:
  - name: A
    steps:
      - name: run
        run: echo A
  - name: B
    steps:
      - name: run
        run: echo B
  - name: C
    needs: [A, B]
    steps:
      - name: run
        run: echo C
  - name: D
    needs: [C]
    if: startsWith(ref, 'refs/tags/v')
    steps:
      - name: run
        run: echo D
"#;
