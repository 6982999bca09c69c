//! Per-instance secret scoping.
//!
//! A job instance only ever sees the secrets its template declares. Values
//! are resolved when the instance is about to run and live only in that
//! instance's execution environment.

use crate::manager::SecretManager;
use ferrule_core::Error;
use ferrule_core::ids::InstanceId;
use ferrule_core::pipeline::SecretReference;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, warn};

#[derive(Debug, ThisError)]
pub enum SecretError {
    #[error("missing credential `{0}`")]
    MissingCredential(String),

    #[error("secret provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("secret provider failed for `{name}`: {source}")]
    Provider {
        name: String,
        #[source]
        source: Error,
    },
}

/// Resolved secrets of one instance, keyed by environment variable name.
#[derive(Clone, Default)]
pub struct ScopedSecrets {
    values: HashMap<String, String>,
}

impl ScopedSecrets {
    /// Environment variable names this instance receives, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.values.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Add the secrets to an execution environment, overriding plain vars.
    pub fn apply_to(&self, env: &mut HashMap<String, String>) {
        env.extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Replace every secret value occurring in `input` with `***`.
    pub fn mask(&self, input: &str) -> String {
        let mut values: Vec<&String> = self.values.values().filter(|v| !v.is_empty()).collect();
        // Longest first so a secret containing another is masked whole.
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut output = input.to_string();
        for value in values {
            output = output.replace(value.as_str(), "***");
        }
        output
    }
}

impl std::fmt::Debug for ScopedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedSecrets")
            .field("names", &self.names())
            .finish()
    }
}

/// Resolves the secrets a job instance is entitled to.
#[derive(Clone)]
pub struct SecretScope {
    manager: Arc<SecretManager>,
}

impl SecretScope {
    pub fn new(manager: Arc<SecretManager>) -> Self {
        Self { manager }
    }

    /// Resolve the declared secrets of `instance`.
    ///
    /// An instance with no declarations gets an empty set without touching
    /// the store. A required secret that is absent fails the whole
    /// resolution; optional ones are left out.
    pub async fn resolve(
        &self,
        instance: &InstanceId,
        declared: &[SecretReference],
    ) -> Result<ScopedSecrets, SecretError> {
        let mut values = HashMap::new();

        for reference in declared {
            match self.manager.resolve(reference).await {
                Ok(secret) => {
                    values.insert(reference.name.clone(), secret.value);
                }
                Err(Error::SecretNotFound(_)) if !reference.required => {
                    debug!(instance = %instance, secret = %reference.name, "Optional secret absent");
                }
                Err(Error::SecretNotFound(_)) => {
                    warn!(instance = %instance, secret = %reference.name, "Required secret absent");
                    return Err(SecretError::MissingCredential(reference.name.clone()));
                }
                Err(Error::SecretProviderNotConfigured(provider)) => {
                    return Err(SecretError::ProviderNotConfigured(provider));
                }
                Err(source) => {
                    return Err(SecretError::Provider {
                        name: reference.name.clone(),
                        source,
                    });
                }
            }
        }

        debug!(instance = %instance, count = values.len(), "Secrets scoped to instance");
        Ok(ScopedSecrets { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SecretManagerConfig;
    use crate::providers::FileProvider;

    fn scope_with(secrets: &[(&str, &str)]) -> SecretScope {
        let map = secrets
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut manager = SecretManager::new(SecretManagerConfig {
            default_provider: "file".to_string(),
            ..Default::default()
        });
        manager.register_provider("file", Arc::new(FileProvider::from_map(map)));
        SecretScope::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn test_undeclared_gets_nothing() {
        let scope = scope_with(&[("CRATES_TOKEN", "abc")]);
        let scoped = scope.resolve(&InstanceId::new("lint"), &[]).await.unwrap();
        assert!(scoped.names().is_empty());
    }

    #[tokio::test]
    async fn test_declared_secret_is_renamed() {
        let scope = scope_with(&[("CRATES_TOKEN", "abc")]);
        let reference = SecretReference {
            key: Some("CRATES_TOKEN".to_string()),
            ..SecretReference::named("CARGO_REGISTRY_TOKEN")
        };

        let scoped = scope
            .resolve(&InstanceId::new("publish"), &[reference])
            .await
            .unwrap();
        assert_eq!(scoped.names(), vec!["CARGO_REGISTRY_TOKEN"]);

        let mut env = HashMap::new();
        env.insert("CARGO_REGISTRY_TOKEN".to_string(), "plain".to_string());
        scoped.apply_to(&mut env);
        assert_eq!(env["CARGO_REGISTRY_TOKEN"], "abc");
    }

    #[tokio::test]
    async fn test_missing_required_secret() {
        let scope = scope_with(&[]);
        let err = scope
            .resolve(&InstanceId::new("publish"), &[SecretReference::named("CRATES_TOKEN")])
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::MissingCredential(ref n) if n == "CRATES_TOKEN"));
        assert_eq!(err.to_string(), "missing credential `CRATES_TOKEN`");
    }

    #[tokio::test]
    async fn test_missing_optional_secret_is_omitted() {
        let scope = scope_with(&[("A", "1")]);
        let optional = SecretReference {
            required: false,
            ..SecretReference::named("B")
        };
        let scoped = scope
            .resolve(
                &InstanceId::new("job"),
                &[SecretReference::named("A"), optional],
            )
            .await
            .unwrap();
        assert_eq!(scoped.names(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_mask_and_debug() {
        let scope = scope_with(&[("SHORT", "abc"), ("LONG", "abcdef")]);
        let scoped = scope
            .resolve(
                &InstanceId::new("job"),
                &[SecretReference::named("SHORT"), SecretReference::named("LONG")],
            )
            .await
            .unwrap();

        assert_eq!(scoped.mask("token=abcdef, short=abc"), "token=***, short=***");
        let debug = format!("{:?}", scoped);
        assert!(debug.contains("LONG"));
        assert!(!debug.contains("abcdef"));
    }
}
