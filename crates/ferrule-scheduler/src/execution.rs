//! Execution of one job instance.
//!
//! Secrets are resolved when the instance starts, the step environment is
//! layered, and steps run in order on the configured [`StepRunner`].
//!
//! Environment layering, later wins:
//! run variables, pipeline `env`, job `env`, `MATRIX_<AXIS>`, step `env`,
//! then the instance's secrets.

use crate::matrix::JobInstance;
use crate::triggers::TriggerEvent;
use chrono::Utc;
use ferrule_core::ids::RunId;
use ferrule_core::interpolation::InterpolationContext;
use ferrule_core::pipeline::StepDefinition;
use ferrule_core::run::{InstanceReport, JobState, StepReport, StepStatus, TerminalReason};
use ferrule_runner::{OutputLine, StepContext, StepRunner};
use ferrule_secrets::{ScopedSecrets, SecretError, SecretScope};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const OUTPUT_BUFFER: usize = 256;

/// Everything an instance needs to run, detached from the scheduler.
pub(crate) struct InstanceExecution {
    pub run_id: RunId,
    pub instance: JobInstance,
    pub event: TriggerEvent,
    pub pipeline_env: Arc<HashMap<String, String>>,
    pub runner: Arc<dyn StepRunner>,
    pub secrets: SecretScope,
    pub workspace: PathBuf,
    pub default_step_timeout: Option<Duration>,
}

impl InstanceExecution {
    pub async fn run(self) -> InstanceReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let template = Arc::clone(&self.instance.template);

        let (state, reason, steps) = match self
            .secrets
            .resolve(&self.instance.id, &template.secrets)
            .await
        {
            Ok(secrets) => self.run_steps(&template.steps, &secrets).await,
            Err(err) => {
                warn!(instance = %self.instance.id, error = %err, "Secret resolution failed");
                let reason = match err {
                    SecretError::MissingCredential(secret) => {
                        TerminalReason::MissingCredential { secret }
                    }
                    other => TerminalReason::ExecutionError {
                        message: other.to_string(),
                    },
                };
                let steps = template
                    .steps
                    .iter()
                    .map(|s| StepReport::not_run(&s.name))
                    .collect();
                (JobState::Failed, reason, steps)
            }
        };

        InstanceReport {
            id: self.instance.id.clone(),
            state,
            reason,
            steps,
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
            duration_ms: Some(start.elapsed().as_millis() as u64),
        }
    }

    async fn run_steps(
        &self,
        steps: &[StepDefinition],
        secrets: &ScopedSecrets,
    ) -> (JobState, TerminalReason, Vec<StepReport>) {
        let base_env = self.base_env();
        let mut reports = Vec::with_capacity(steps.len());
        let mut failure = None;

        for step in steps {
            if failure.is_some() {
                reports.push(StepReport::not_run(&step.name));
                continue;
            }

            let (report, reason) = self.run_step(step, &base_env, secrets).await;
            match report.status {
                StepStatus::Failed => failure = reason,
                StepStatus::FailedIgnored => {
                    warn!(instance = %self.instance.id, step = %step.name, "Step failed, continuing");
                }
                _ => {}
            }
            reports.push(report);
        }

        match failure {
            Some(reason) => (JobState::Failed, reason, reports),
            None => (JobState::Succeeded, TerminalReason::Succeeded, reports),
        }
    }

    async fn run_step(
        &self,
        step: &StepDefinition,
        base_env: &HashMap<String, String>,
        secrets: &ScopedSecrets,
    ) -> (StepReport, Option<TerminalReason>) {
        let start = Instant::now();
        let mut interpolation = self.interpolation(base_env);

        let mut env = base_env.clone();
        for (key, value) in &step.env {
            env.insert(key.clone(), interpolation.interpolate(value));
        }
        interpolation.variables = env.clone();
        let command = interpolation.interpolate(&step.run);
        secrets.apply_to(&mut env);

        let ctx = StepContext {
            step_name: step.name.clone(),
            command,
            shell: step.shell.clone(),
            workspace: self.workspace.clone(),
            working_directory: step.working_directory.clone(),
            env,
            timeout: step
                .timeout_minutes
                .map(|m| Duration::from_secs(u64::from(m) * 60))
                .or(self.default_step_timeout),
        };

        info!(instance = %self.instance.id, step = %step.name, "Running step");

        let label = self.instance.id.to_string();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (result, output) = tokio::join!(
            self.runner.execute(&ctx, output_tx),
            collect_output(output_rx, secrets, &label, &step.name)
        );
        let elapsed = start.elapsed().as_millis() as u64;

        let (exit_code, failure) = match result {
            Ok(result) if result.success => (Some(result.exit_code), None),
            Ok(result) => (
                Some(result.exit_code),
                Some(TerminalReason::StepFailed {
                    step: step.name.clone(),
                    exit_code: Some(result.exit_code),
                    message: None,
                }),
            ),
            Err(err) => (
                None,
                Some(TerminalReason::StepFailed {
                    step: step.name.clone(),
                    exit_code: None,
                    message: Some(secrets.mask(&err.to_string())),
                }),
            ),
        };

        let status = match (&failure, step.continue_on_error) {
            (None, _) => StepStatus::Succeeded,
            (Some(_), true) => StepStatus::FailedIgnored,
            (Some(_), false) => StepStatus::Failed,
        };

        debug!(
            instance = %self.instance.id,
            step = %step.name,
            exit_code = ?exit_code,
            duration_ms = elapsed,
            "Step finished"
        );

        let report = StepReport {
            name: step.name.clone(),
            status,
            exit_code,
            duration_ms: elapsed,
            output,
        };
        (report, failure)
    }

    /// Variables shared by every step of the instance, secrets excluded.
    fn base_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("FERRULE_RUN_ID".to_string(), self.run_id.to_string());
        env.insert("FERRULE_REF".to_string(), self.event.git_ref.clone());
        env.insert("FERRULE_EVENT".to_string(), self.event.kind.to_string());
        env.insert("FERRULE_JOB".to_string(), self.instance.id.to_string());

        env.extend(self.pipeline_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(
            self.instance
                .template
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        for (axis, value) in &self.instance.id.params {
            env.insert(matrix_var(axis), value.clone());
        }
        env
    }

    fn interpolation(&self, variables: &HashMap<String, String>) -> InterpolationContext {
        InterpolationContext {
            variables: variables.clone(),
            matrix: self.instance.matrix_values(),
            git_ref: self.event.git_ref.clone(),
            event: self.event.kind.to_string(),
        }
    }
}

/// `MATRIX_<AXIS>` with the axis upper-cased and dashes turned into `_`.
pub(crate) fn matrix_var(axis: &str) -> String {
    format!("MATRIX_{}", axis.to_uppercase().replace('-', "_"))
}

async fn collect_output(
    mut rx: mpsc::Receiver<OutputLine>,
    secrets: &ScopedSecrets,
    instance: &str,
    step: &str,
) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        let masked = secrets.mask(&line.content);
        debug!(instance, step, stream = ?line.stream, "{}", masked);
        lines.push(masked);
    }
    lines
}
