//! Matrix expansion for parallel job generation.

use ferrule_core::ids::InstanceId;
use ferrule_core::pipeline::{JobDefinition, MatrixAxes, scalar_to_string};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A template bound to one concrete combination of matrix values.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: InstanceId,
    pub template: Arc<JobDefinition>,
}

impl JobInstance {
    /// Matrix values of this instance, keyed by axis name.
    pub fn matrix_values(&self) -> HashMap<String, String> {
        self.id.params.iter().cloned().collect()
    }
}

type Combination = Vec<(String, Value)>;

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a job template into its instances.
    ///
    /// The first axis is the outermost loop, so `{os: [x, y], v: [1, 2]}`
    /// yields `(x,1) (x,2) (y,1) (y,2)`. Include entries are appended after
    /// the product, exclude entries remove every combination they match.
    /// A job without a matrix expands to exactly one instance; an axis with
    /// no values removes the whole product.
    pub fn expand(&self, job: &JobDefinition) -> Vec<JobInstance> {
        let template = Arc::new(job.clone());

        let Some(matrix) = &job.matrix else {
            return vec![JobInstance {
                id: InstanceId::new(&job.name),
                template,
            }];
        };

        let mut combinations = self.generate_combinations(&matrix.axes);

        // Apply includes; identity is the rendered parameters, so `1` and `"1"` collide
        for include in &matrix.include {
            let combo = self.include_combination(&matrix.axes, include);
            let params = render(&combo);
            if !combinations.iter().any(|existing| render(existing) == params) {
                combinations.push(combo);
            }
        }

        // Apply excludes
        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        combinations
            .iter()
            .map(|combo| JobInstance {
                id: InstanceId::with_params(&job.name, render(combo)),
                template: Arc::clone(&template),
            })
            .collect()
    }

    fn generate_combinations(&self, axes: &MatrixAxes) -> Vec<Combination> {
        let mut result = vec![Vec::new()];

        for axis in axes.iter() {
            let mut new_result = Vec::with_capacity(result.len() * axis.values.len());

            for combo in result {
                for value in &axis.values {
                    let mut new_combo = combo.clone();
                    new_combo.push((axis.name.clone(), value.clone()));
                    new_result.push(new_combo);
                }
            }

            result = new_result;
        }

        result
    }

    /// Declared axes first in axis order, then extra keys alphabetically.
    fn include_combination(&self, axes: &MatrixAxes, include: &HashMap<String, Value>) -> Combination {
        let mut combo: Combination = axes
            .iter()
            .filter_map(|axis| {
                include
                    .get(&axis.name)
                    .map(|value| (axis.name.clone(), value.clone()))
            })
            .collect();

        let mut extra: Vec<(&String, &Value)> = include
            .iter()
            .filter(|(key, _)| axes.get(key).is_none())
            .collect();
        extra.sort_by(|a, b| a.0.cmp(b.0));
        combo.extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));

        combo
    }

    fn matches_exclude(&self, combo: &Combination, exclude: &HashMap<String, Value>) -> bool {
        exclude.iter().all(|(key, value)| {
            combo
                .iter()
                .any(|(axis, combo_value)| axis == key && same_scalar(combo_value, value))
        })
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

fn render(combo: &Combination) -> Vec<(String, String)> {
    combo
        .iter()
        .map(|(axis, value)| (axis.clone(), value_string(value)))
        .collect()
}

fn value_string(value: &Value) -> String {
    scalar_to_string(value).unwrap_or_else(|| value.to_string())
}

// `1` in an exclude entry matches `"1"` on the axis and the other way round.
fn same_scalar(a: &Value, b: &Value) -> bool {
    a == b || value_string(a) == value_string(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrule_core::pipeline::PipelineDefinition;
    use pretty_assertions::assert_eq;

    fn job(yaml: &str) -> JobDefinition {
        let pipeline = PipelineDefinition::from_yaml(yaml).unwrap();
        pipeline.jobs.into_iter().next().unwrap()
    }

    fn ids(instances: &[JobInstance]) -> Vec<String> {
        instances.iter().map(|i| i.id.to_string()).collect()
    }

    #[test]
    fn test_no_matrix_single_instance() {
        let job = job("name: p\njobs:\n  - name: lint\n    steps:\n      - name: s\n        run: cargo clippy\n");
        let instances = MatrixExpander::new().expand(&job);
        assert_eq!(ids(&instances), vec!["lint"]);
        assert!(!instances[0].id.is_matrix());
    }

    #[test]
    fn test_first_axis_outermost() {
        let job = job(
            r#"
name: p
jobs:
  - name: test
    matrix:
      axes:
        os: [x, y]
        v: [1, 2]
    steps:
      - name: s
        run: "true"
"#,
        );
        let instances = MatrixExpander::new().expand(&job);
        assert_eq!(
            ids(&instances),
            vec![
                "test (os=x, v=1)",
                "test (os=x, v=2)",
                "test (os=y, v=1)",
                "test (os=y, v=2)",
            ]
        );
        assert_eq!(instances[1].matrix_values().get("v").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let job = job(
            r#"
name: p
jobs:
  - name: test
    matrix:
      axes:
        zeta: [a, b]
        alpha: [c, d]
        mid: [e]
    steps:
      - name: s
        run: "true"
"#,
        );
        let expander = MatrixExpander::new();
        let first = ids(&expander.expand(&job));
        for _ in 0..10 {
            assert_eq!(ids(&expander.expand(&job)), first);
        }
        assert_eq!(first[0], "test (zeta=a, alpha=c, mid=e)");
    }

    #[test]
    fn test_empty_axis_yields_nothing() {
        let job = job(
            r#"
name: p
jobs:
  - name: test
    matrix:
      axes:
        os: [x, y]
        v: []
    steps:
      - name: s
        run: "true"
"#,
        );
        assert!(MatrixExpander::new().expand(&job).is_empty());
    }

    #[test]
    fn test_include_and_exclude() {
        let job = job(
            r#"
name: p
jobs:
  - name: test
    matrix:
      axes:
        os: [linux, macos]
        rust: [stable, beta]
      exclude:
        - os: macos
          rust: beta
      include:
        - os: windows
          rust: stable
        - os: linux
          rust: stable
    steps:
      - name: s
        run: "true"
"#,
        );
        let instances = MatrixExpander::new().expand(&job);
        assert_eq!(
            ids(&instances),
            vec![
                "test (os=linux, rust=stable)",
                "test (os=linux, rust=beta)",
                "test (os=macos, rust=stable)",
                "test (os=windows, rust=stable)",
            ]
        );
    }

    #[test]
    fn test_exclude_matches_numbers_and_strings() {
        let job = job(
            r#"
name: p
jobs:
  - name: test
    matrix:
      axes:
        v: [1, 2, 3]
      exclude:
        - v: "2"
    steps:
      - name: s
        run: "true"
"#,
        );
        assert_eq!(
            ids(&MatrixExpander::new().expand(&job)),
            vec!["test (v=1)", "test (v=3)"]
        );
    }

    #[test]
    fn test_include_matching_rendered_combination_is_not_duplicated() {
        let job = job(
            r#"
name: p
jobs:
  - name: t
    matrix:
      axes:
        v: [1, 2]
      include:
        - v: "1"
        - v: 3
        - v: "3"
    steps:
      - name: s
        run: "true"
"#,
        );
        assert_eq!(
            ids(&MatrixExpander::new().expand(&job)),
            vec!["t (v=1)", "t (v=2)", "t (v=3)"]
        );
    }
}
