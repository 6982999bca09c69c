//! Command handlers.

use crate::commands::{EventArgs, FormatArg};
use crate::config::{CliConfig, OutputFormat};
use anyhow::{Context, Result};
use console::style;
use ferrule_core::pipeline::PipelineDefinition;
use ferrule_core::run::{JobState, RunReport};
use ferrule_runner::{RunnerConfig, ShellRunner};
use ferrule_scheduler::{DagBuilder, RunController, RunOutcome, RunPlan, SchedulerConfig, TriggerEvent};
use ferrule_secrets::{EnvProvider, FileProvider, SecretManager, SecretManagerConfig, SecretScope};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Validate a pipeline definition.
pub fn validate(config: &CliConfig, path: Option<PathBuf>) -> Result<()> {
    let path = pipeline_path(config, path);
    let definition = load_definition(&path)?;
    let graph = DagBuilder::new()
        .build(&definition)
        .map_err(ferrule_core::Error::from)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {} ({} instances)", definition.jobs.len(), graph.len());

    for job in &definition.jobs {
        let instances = graph.instances_of(&job.name).len();
        let mut line = format!("    - {} ({} steps", job.name, job.steps.len());
        if job.matrix.is_some() {
            let _ = write!(line, ", {} instances", instances);
        }
        line.push(')');
        if !job.needs.is_empty() {
            let _ = write!(line, " needs {}", job.needs.join(", "));
        }
        if let Some(condition) = &job.condition {
            let _ = write!(line, " if {}", style(condition).dim());
        }
        println!("{}", line);
    }

    Ok(())
}

/// Print what a run would do for an event.
pub fn plan(
    config: &CliConfig,
    path: Option<PathBuf>,
    event: EventArgs,
    format: Option<FormatArg>,
) -> Result<()> {
    let path = pipeline_path(config, path);
    let definition = load_definition(&path)?;
    let controller = RunController::new(
        definition,
        Arc::new(ShellRunner::default()),
        SecretScope::new(Arc::new(SecretManager::new(SecretManagerConfig::default()))),
    );

    let plan = controller.plan(&TriggerEvent::new(event.event, event.git_ref))?;
    match output_format(config, format) {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Table => print!("{}", render_plan(&plan)),
    }
    Ok(())
}

/// Execute a pipeline. Returns whether the run succeeded.
pub async fn run(
    config: &CliConfig,
    path: Option<PathBuf>,
    event: EventArgs,
    secrets_file: Option<PathBuf>,
    workspace: Option<PathBuf>,
    format: Option<FormatArg>,
) -> Result<bool> {
    let path = pipeline_path(config, path);
    let definition = load_definition(&path)?;
    let format = output_format(config, format);

    let secrets_file = secrets_file.or_else(|| config.secrets_file.clone());
    let secrets = secret_scope(config, secrets_file.as_deref()).await?;

    let workspace = match workspace.or_else(|| config.workspace.clone()) {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let step_timeout = config
        .step_timeout_minutes
        .map(|m| Duration::from_secs(u64::from(m) * 60));

    let runner = ShellRunner::new(RunnerConfig {
        passthrough_env: config.passthrough_env.clone(),
        ..RunnerConfig::default()
    });
    let controller = RunController::new(definition, Arc::new(runner), secrets).with_config(
        SchedulerConfig {
            workspace,
            default_step_timeout: step_timeout,
        },
    );

    let trigger = TriggerEvent::new(event.event, event.git_ref);
    if format == OutputFormat::Table {
        println!(
            "\n{} Running pipeline: {} ({} {})\n",
            style("▶").cyan().bold(),
            style(&controller.definition().name).bold(),
            trigger.kind,
            style(&trigger.git_ref).dim()
        );
    }

    match controller.execute(&trigger).await? {
        RunOutcome::NotTriggered => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "triggered": false })),
                OutputFormat::Table => println!(
                    "{} Event does not match any trigger; nothing to run",
                    style("-").dim()
                ),
            }
            Ok(true)
        }
        RunOutcome::Completed(report) => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Table => print!("{}", render_report(&report)),
            }
            Ok(report.status.is_success())
        }
    }
}

/// Print the JSON schema of pipeline definitions.
pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> Result<()> {
    println!("Current configuration:");
    println!("  default_pipeline: {}", config.default_pipeline.display());
    println!(
        "  workspace: {}",
        config
            .workspace
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(current directory)".to_string())
    );
    println!(
        "  secrets_file: {}",
        config
            .secrets_file
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!("  secret_env_prefix: {}", config.secret_env_prefix);
    println!("  output_format: {:?}", config.output_format);
    println!("  passthrough_env: {}", config.passthrough_env.join(", "));
    println!(
        "  step_timeout_minutes: {}",
        config
            .step_timeout_minutes
            .map(|m| m.to_string())
            .unwrap_or_else(|| "(runner default)".to_string())
    );

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value).map_err(anyhow::Error::msg)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

pub fn config_path() -> Result<()> {
    println!("{}", CliConfig::config_path()?.display());
    Ok(())
}

fn pipeline_path(config: &CliConfig, path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| config.default_pipeline.clone())
}

fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline {}", path.display()))?;
    let definition = PipelineDefinition::from_yaml(&content)
        .with_context(|| format!("invalid pipeline {}", path.display()))?;
    debug!(pipeline = %definition.name, jobs = definition.jobs.len(), "Loaded pipeline");
    Ok(definition)
}

fn output_format(config: &CliConfig, arg: Option<FormatArg>) -> OutputFormat {
    match arg {
        Some(FormatArg::Table) => OutputFormat::Table,
        Some(FormatArg::Json) => OutputFormat::Json,
        None => config.output_format,
    }
}

/// Environment provider always; a secrets file becomes the default store.
async fn secret_scope(config: &CliConfig, secrets_file: Option<&Path>) -> Result<SecretScope> {
    let mut manager_config = SecretManagerConfig::default();
    if secrets_file.is_some() {
        manager_config.default_provider = "file".to_string();
    }

    let mut manager = SecretManager::new(manager_config);
    manager.register_provider(
        "env",
        Arc::new(EnvProvider::new(Some(config.secret_env_prefix.clone()))),
    );
    if let Some(path) = secrets_file {
        let provider = FileProvider::load_from_file(path)
            .await
            .with_context(|| format!("loading secrets from {}", path.display()))?;
        manager.register_provider("file", Arc::new(provider));
    }

    Ok(SecretScope::new(Arc::new(manager)))
}

fn state_label(state: JobState) -> String {
    let label = state.to_string();
    match state {
        JobState::Succeeded => style(label).green().to_string(),
        JobState::Failed => style(label).red().bold().to_string(),
        JobState::GatedSkip | JobState::Skipped => style(label).yellow().to_string(),
        _ => style(label).dim().to_string(),
    }
}

fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let width = report
        .instances
        .iter()
        .map(|i| i.id.to_string().len())
        .max()
        .unwrap_or(0);

    for instance in &report.instances {
        let id = instance.id.to_string();
        let _ = write!(out, "  {:<width$}  {:<12}", id, state_label(instance.state), width = width);
        if instance.state != JobState::Succeeded {
            let _ = write!(out, "  {}", style(&instance.reason).dim());
        }
        if let Some(ms) = instance.duration_ms {
            let _ = write!(out, "  {:.2}s", ms as f64 / 1000.0);
        }
        out.push('\n');

        if instance.state == JobState::Failed {
            for step in &instance.steps {
                for line in step.output.iter().rev().take(5).rev() {
                    let _ = writeln!(out, "      {} {}", style("│").dim(), line);
                }
            }
        }
    }

    let summary = report.summary();
    let _ = writeln!(
        out,
        "\n{} succeeded, {} failed, {} skipped by condition, {} skipped by propagation",
        summary.succeeded, summary.failed, summary.skipped_by_condition, summary.skipped_by_propagation
    );
    if report.status.is_success() {
        let _ = writeln!(
            out,
            "{} Run {} succeeded in {:.2}s",
            style("✓").green().bold(),
            report.run_id,
            report.duration_ms as f64 / 1000.0
        );
    } else {
        let _ = writeln!(
            out,
            "{} Run {} failed after {:.2}s",
            style("✗").red().bold(),
            report.run_id,
            report.duration_ms as f64 / 1000.0
        );
    }
    out
}

fn render_plan(plan: &RunPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Pipeline {} for {} {}",
        style(&plan.pipeline_name).bold(),
        plan.event,
        plan.git_ref
    );
    if !plan.triggered {
        let _ = writeln!(out, "{} Event does not match any trigger", style("-").dim());
        return out;
    }

    for (position, instance) in plan.instances.iter().enumerate() {
        let marker = if instance.gate_open {
            style("●").green().to_string()
        } else {
            style("○").yellow().to_string()
        };
        let _ = write!(out, "  {:>2}. {} {}", position + 1, marker, instance.id);
        if !instance.needs.is_empty() {
            let needs: Vec<String> = instance.needs.iter().map(|n| n.to_string()).collect();
            let _ = write!(out, "  needs {}", needs.join(", "));
        }
        if let Some(condition) = &instance.condition {
            let verdict = if instance.gate_open { "open" } else { "closed" };
            let _ = write!(out, "  if {} ({})", condition, verdict);
        }
        out.push('\n');
    }
    out
}
