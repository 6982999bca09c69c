//! Secret manager for resolving and caching secrets across providers.

use crate::providers::{SecretProvider, SecretValue};
use ferrule_core::pipeline::SecretReference;
use ferrule_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Configuration for the secret manager.
#[derive(Debug, Clone)]
pub struct SecretManagerConfig {
    /// Cache TTL in seconds.
    pub cache_ttl_seconds: u64,
    /// Provider used when a reference names none.
    pub default_provider: String,
}

impl Default for SecretManagerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            default_provider: "env".to_string(),
        }
    }
}

struct CachedSecret {
    value: SecretValue,
    cached_at: std::time::Instant,
}

/// Read-only view over the registered secret providers.
pub struct SecretManager {
    config: SecretManagerConfig,
    providers: HashMap<String, Arc<dyn SecretProvider>>,
    cache: RwLock<HashMap<String, CachedSecret>>,
}

impl SecretManager {
    pub fn new(config: SecretManagerConfig) -> Self {
        Self {
            config,
            providers: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a secret provider under a name.
    pub fn register_provider(&mut self, name: &str, provider: Arc<dyn SecretProvider>) {
        info!(provider = %name, "Registering secret provider");
        self.providers.insert(name.to_string(), provider);
    }

    /// Resolve a single secret reference.
    pub async fn resolve(&self, reference: &SecretReference) -> Result<SecretValue> {
        let provider_key = reference
            .provider
            .as_deref()
            .unwrap_or(&self.config.default_provider);
        let secret_name = reference.store_key();
        let cache_key = format!("{}:{}", provider_key, secret_name);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&cache_key)
                && cached.cached_at.elapsed().as_secs() < self.config.cache_ttl_seconds
            {
                debug!(name = %secret_name, "Secret cache hit");
                return Ok(cached.value.clone());
            }
        }

        let provider = self
            .providers
            .get(provider_key)
            .ok_or_else(|| Error::SecretProviderNotConfigured(provider_key.to_string()))?;

        let value = provider.get(secret_name).await?;

        self.cache.write().await.insert(
            cache_key,
            CachedSecret {
                value: value.clone(),
                cached_at: std::time::Instant::now(),
            },
        );

        debug!(name = %secret_name, provider = %provider_key, "Secret resolved");
        Ok(value)
    }

    #[cfg(test)]
    async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new(SecretManagerConfig::default())
    }
}
