//! Strongly-typed identifiers for domain entities.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(RunId, "run");

/// Identity of a job instance: the template name plus the matrix combination
/// it was bound to. Parameters keep axis declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct InstanceId {
    pub job: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<(String, String)>,
}

impl InstanceId {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(job: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            job: job.into(),
            params,
        }
    }

    pub fn is_matrix(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn param(&self, axis: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == axis)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            return write!(f, "{}", self.job);
        }
        let parts: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{} ({})", self.job, parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_display() {
        let id = RunId::new();
        assert!(id.to_string().starts_with("run_"));
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_instance_id_display() {
        assert_eq!(InstanceId::new("lint").to_string(), "lint");

        let id = InstanceId::with_params(
            "test",
            vec![
                ("os".to_string(), "linux".to_string()),
                ("rust".to_string(), "beta".to_string()),
            ],
        );
        assert_eq!(id.to_string(), "test (os=linux, rust=beta)");
        assert_eq!(id.param("rust"), Some("beta"));
        assert_eq!(id.param("arch"), None);
    }
}
