//! Error types for Ferrule.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job {job} needs unknown job {dependency}")]
    UnknownDependency { job: String, dependency: String },

    #[error("Dependency cycle between jobs: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Invalid matrix for job {job}: {message}")]
    InvalidMatrix { job: String, message: String },

    #[error("Invalid condition for job {job}: {message}")]
    InvalidCondition { job: String, message: String },

    // Step errors
    #[error("Step timed out after {limit:?}")]
    StepTimeout { limit: Duration },

    // Secret errors
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret provider not configured: {0}")]
    SecretProviderNotConfigured(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is detected before any job instance starts.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPipeline(_)
                | Error::DuplicateJob(_)
                | Error::UnknownDependency { .. }
                | Error::DependencyCycle(_)
                | Error::InvalidMatrix { .. }
                | Error::InvalidCondition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidPipeline(err.to_string())
    }
}
