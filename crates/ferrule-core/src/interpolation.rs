//! `${{ ... }}` expansion for step commands and step environment values.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid interpolation regex"));

/// Context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline, job and step variables.
    pub variables: HashMap<String, String>,
    /// Matrix values for the current instance.
    pub matrix: HashMap<String, String>,
    /// Triggering ref.
    pub git_ref: String,
    /// Triggering event kind.
    pub event: String,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ matrix.key }}` - matrix value
    /// - `${{ env.VAR }}` - job variable
    /// - `${{ ref }}` / `${{ event }}` - run context
    /// - `${{ VAR }}` - direct variable lookup
    ///
    /// Unknown expressions expand to the empty string. Secrets are not part
    /// of the context, so they can never be spliced into a command line.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self.variables.get(var_name).cloned().unwrap_or_default();
        }
        match expr {
            "ref" => self.git_ref.clone(),
            "event" => self.event.clone(),
            _ => self.variables.get(expr).cloned().unwrap_or_default(),
        }
    }
}
