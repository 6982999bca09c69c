//! Secret provider trait and implementations.

use async_trait::async_trait;
use ferrule_core::{Error, Result};
use std::collections::HashMap;

/// A resolved secret value.
#[derive(Clone)]
pub struct SecretValue {
    pub value: String,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretValue")
            .field("value", &"***")
            .finish()
    }
}

/// Trait for secret providers.
///
/// Providers are read-only from the orchestrator's point of view.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get a secret by name. A missing secret is `Error::SecretNotFound`.
    async fn get(&self, name: &str) -> Result<SecretValue>;
}

/// Environment variable secret provider.
pub struct EnvProvider {
    prefix: Option<String>,
}

impl EnvProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn resolve_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{}{}", p, name),
            None => name.to_string(),
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    async fn get(&self, name: &str) -> Result<SecretValue> {
        let env_name = self.resolve_name(name);
        std::env::var(&env_name)
            .map(SecretValue::new)
            .map_err(|_| Error::SecretNotFound(name.to_string()))
    }
}

/// Map-backed secret provider, loadable from a JSON file.
#[derive(Default)]
pub struct FileProvider {
    secrets: HashMap<String, String>,
}

impl FileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// Load a JSON object of `{ "NAME": "value" }` pairs.
    pub async fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to read secrets file {}: {}",
                path.display(),
                e
            ))
        })?;

        let secrets: HashMap<String, String> = serde_json::from_str(&content)?;
        Ok(Self { secrets })
    }
}

#[async_trait]
impl SecretProvider for FileProvider {
    async fn get(&self, name: &str) -> Result<SecretValue> {
        self.secrets
            .get(name)
            .map(SecretValue::new)
            .ok_or_else(|| Error::SecretNotFound(name.to_string()))
    }
}
