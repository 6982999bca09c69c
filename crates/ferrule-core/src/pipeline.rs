//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.
//! They are immutable once loaded; scheduling state lives in [`crate::run`].

use crate::{Error, Result};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::Schema;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

impl PipelineDefinition {
    /// Parse and structurally validate a YAML pipeline document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Look up a job template by name.
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Structural checks that need no graph: names, steps, matrix shapes.
    ///
    /// Cycles and condition syntax are checked when the job graph is built.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            return Err(Error::InvalidPipeline("pipeline has no jobs".to_string()));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(Error::InvalidPipeline("job with empty name".to_string()));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(Error::DuplicateJob(job.name.clone()));
            }
        }

        for job in &self.jobs {
            for dep in &job.needs {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        job: job.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            for step in &job.steps {
                if step.run.trim().is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "step {} in job {} has an empty command",
                        step.name, job.name
                    )));
                }
            }
            if let Some(matrix) = &job.matrix {
                matrix.validate(&job.name)?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Gate expression, e.g. `startsWith(ref, 'refs/tags/v0')`.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<SecretReference>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    pub run: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// A secret a job declares it needs.
///
/// Written either as a bare name (`CRATES_TOKEN`) or as a mapping with an
/// explicit store key and provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SecretReferenceRepr")]
pub struct SecretReference {
    /// Environment variable the value is exposed as.
    pub name: String,
    /// Key in the secret store; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl SecretReference {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            provider: None,
            required: true,
        }
    }

    pub fn store_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(untagged)]
enum SecretReferenceRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        provider: Option<String>,
        #[serde(default = "default_true")]
        required: bool,
    },
}

impl From<SecretReferenceRepr> for SecretReference {
    fn from(repr: SecretReferenceRepr) -> Self {
        match repr {
            SecretReferenceRepr::Name(name) => SecretReference::named(name),
            SecretReferenceRepr::Full {
                name,
                key,
                provider,
                required,
            } => SecretReference {
                name,
                key,
                provider,
                required,
            },
        }
    }
}

impl JsonSchema for SecretReference {
    fn schema_name() -> String {
        "SecretReference".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        SecretReferenceRepr::json_schema(generator)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    pub axes: MatrixAxes,
    #[serde(default)]
    pub include: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<HashMap<String, serde_json::Value>>,
}

impl MatrixConfig {
    fn validate(&self, job: &str) -> Result<()> {
        let invalid = |message: String| Error::InvalidMatrix {
            job: job.to_string(),
            message,
        };

        for axis in &self.axes.0 {
            let mut seen = HashSet::new();
            for value in &axis.values {
                let Some(rendered) = scalar_to_string(value) else {
                    return Err(invalid(format!(
                        "axis {} has a non-scalar value {}",
                        axis.name, value
                    )));
                };
                if !seen.insert(rendered) {
                    return Err(invalid(format!(
                        "axis {} lists {} more than once",
                        axis.name, value
                    )));
                }
            }
        }
        for entry in self.include.iter().chain(&self.exclude) {
            if let Some((key, _)) = entry.iter().find(|(_, v)| scalar_to_string(v).is_none()) {
                return Err(invalid(format!("include/exclude key {} is not a scalar", key)));
            }
        }
        for entry in &self.exclude {
            if let Some(key) = entry.keys().find(|k| self.axes.get(k).is_none()) {
                return Err(invalid(format!("exclude references unknown axis {}", key)));
            }
        }
        Ok(())
    }
}

/// One named parameter axis.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<serde_json::Value>,
}

/// Matrix axes in document order.
///
/// Written as a YAML mapping; unlike a `HashMap` the declared order survives
/// deserialization, which keeps expansion order stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixAxes(pub Vec<MatrixAxis>);

impl MatrixAxes {
    pub fn iter(&self) -> impl Iterator<Item = &MatrixAxis> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&MatrixAxis> {
        self.0.iter().find(|a| a.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for MatrixAxes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for axis in &self.0 {
            map.serialize_entry(&axis.name, &axis.values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixAxes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AxesVisitor;

        impl<'de> Visitor<'de> for AxesVisitor {
            type Value = MatrixAxes;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of axis name to a list of values")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut axes: Vec<MatrixAxis> = Vec::new();
                while let Some((name, values)) =
                    map.next_entry::<String, Vec<serde_json::Value>>()?
                {
                    if axes.iter().any(|a| a.name == name) {
                        return Err(de::Error::custom(format!("duplicate matrix axis `{}`", name)));
                    }
                    axes.push(MatrixAxis { name, values });
                }
                Ok(MatrixAxes(axes))
            }
        }

        deserializer.deserialize_map(AxesVisitor)
    }
}

impl JsonSchema for MatrixAxes {
    fn schema_name() -> String {
        "MatrixAxes".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        <HashMap<String, Vec<serde_json::Value>>>::json_schema(generator)
    }
}

/// Render a scalar matrix value as the string jobs see.
pub fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
