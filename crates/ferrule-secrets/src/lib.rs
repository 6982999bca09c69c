//! Secret providers and per-job secret scoping for Ferrule.

pub mod manager;
pub mod providers;
pub mod scope;

pub use manager::{SecretManager, SecretManagerConfig};
pub use providers::{EnvProvider, FileProvider, SecretProvider, SecretValue};
pub use scope::{ScopedSecrets, SecretError, SecretScope};
