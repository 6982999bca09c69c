//! CLI configuration management.

use anyhow::{Context, Result, anyhow};
use ferrule_runner::runner::default_passthrough_env;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Pipeline file used when a command is given no path.
    #[serde(default = "default_pipeline")]
    pub default_pipeline: PathBuf,
    /// Directory steps run in; the current directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    /// JSON secrets file used by `run` when `--secrets-file` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_file: Option<PathBuf>,
    /// Prefix of environment variables holding secrets.
    #[serde(default = "default_secret_env_prefix")]
    pub secret_env_prefix: String,
    /// Output format.
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Host variables copied into step environments.
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,
    /// Timeout for steps without `timeout_minutes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_minutes: Option<u32>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default_pipeline: default_pipeline(),
            workspace: None,
            secrets_file: None,
            secret_env_prefix: default_secret_env_prefix(),
            output_format: OutputFormat::default(),
            passthrough_env: default_passthrough_env(),
            step_timeout_minutes: None,
        }
    }
}

fn default_pipeline() -> PathBuf {
    PathBuf::from("ferrule.yaml")
}

fn default_secret_env_prefix() -> String {
    "FERRULE_SECRET_".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl CliConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "ferrule", "ferrule")
            .ok_or_else(|| anyhow!("could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "default_pipeline" => self.default_pipeline = PathBuf::from(value),
            "workspace" => self.workspace = optional(value).map(PathBuf::from),
            "secrets_file" => self.secrets_file = optional(value).map(PathBuf::from),
            "secret_env_prefix" => self.secret_env_prefix = value.to_string(),
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    _ => return Err(format!("Invalid output format: {}", value)),
                };
            }
            "passthrough_env" => {
                self.passthrough_env = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "step_timeout_minutes" => {
                self.step_timeout_minutes = match optional(value) {
                    Some(v) => Some(
                        v.parse()
                            .map_err(|_| format!("Invalid number of minutes: {}", v))?,
                    ),
                    None => None,
                };
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}

// An empty value or `none` clears an optional key.
fn optional(value: &str) -> Option<&str> {
    match value.trim() {
        "" | "none" => None,
        v => Some(v),
    }
}
