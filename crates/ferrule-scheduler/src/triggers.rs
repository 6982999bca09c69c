//! Trigger matching and evaluation.
//!
//! Decides whether a run is created at all. Per-job gating inside a run is
//! the business of [`crate::gate`].

use ferrule_core::pipeline::{PipelineDefinition, TriggerConfig, TriggerType};
use ferrule_core::run::EventKind;
use serde::{Deserialize, Serialize};

const BRANCH_PREFIX: &str = "refs/heads/";
const TAG_PREFIX: &str = "refs/tags/";

/// Event that can trigger a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    pub git_ref: String,
}

impl TriggerEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
        }
    }

    pub fn push(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::Push, git_ref)
    }

    pub fn pull_request(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest, git_ref)
    }

    pub fn tag_push(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::TagPush, git_ref)
    }

    /// Branch name when the ref is `refs/heads/<branch>`.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix(BRANCH_PREFIX)
    }

    /// Tag name when the ref is `refs/tags/<tag>`.
    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix(TAG_PREFIX)
    }

    /// Short ref: branch or tag name, or the full ref otherwise.
    pub fn ref_name(&self) -> &str {
        self.branch().or_else(|| self.tag()).unwrap_or(&self.git_ref)
    }
}

/// Matcher for determining if a pipeline should be triggered.
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Check if a pipeline should be triggered by an event.
    ///
    /// Without declared triggers every push, tag push and pull request
    /// creates a run.
    pub fn should_run(&self, pipeline: &PipelineDefinition, event: &TriggerEvent) -> bool {
        if pipeline.triggers.is_empty() {
            return true;
        }

        pipeline
            .triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, event))
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &TriggerEvent) -> bool {
        match event.kind {
            EventKind::PullRequest => {
                trigger.trigger_type == TriggerType::PullRequest
                    && self.branch_matches(&trigger.branches, event.ref_name())
            }
            EventKind::Push | EventKind::TagPush => {
                if trigger.trigger_type != TriggerType::Push {
                    return false;
                }
                let unfiltered = trigger.branches.is_empty() && trigger.tags.is_empty();
                match event.tag() {
                    Some(tag) => unfiltered || self.tag_matches(&trigger.tags, tag),
                    None if event.kind == EventKind::TagPush => unfiltered,
                    None => {
                        if trigger.branches.is_empty() && !trigger.tags.is_empty() {
                            return false; // tag-only trigger
                        }
                        self.branch_matches(&trigger.branches, event.ref_name())
                    }
                }
            }
        }
    }

    fn branch_matches(&self, patterns: &[String], branch: &str) -> bool {
        if patterns.is_empty() {
            return true; // Match all branches if no patterns specified
        }
        patterns.iter().any(|p| glob_match(p, branch))
    }

    fn tag_matches(&self, patterns: &[String], tag: &str) -> bool {
        patterns.iter().any(|p| glob_match(p, tag))
    }
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return text.starts_with(prefix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix_slash = format!("{}/", prefix);
        if let Some(rest) = text.strip_prefix(&prefix_slash) {
            return !rest.contains('/');
        }
        return false;
    }
    if pattern.contains('*') {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return text.len() >= parts[0].len() + parts[1].len()
                && text.starts_with(parts[0])
                && text.ends_with(parts[1]);
        }
    }
    pattern == text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(triggers: Vec<TriggerConfig>) -> PipelineDefinition {
        PipelineDefinition {
            name: "p".to_string(),
            description: None,
            triggers,
            env: Default::default(),
            jobs: vec![],
        }
    }

    fn trigger(kind: TriggerType, branches: &[&str], tags: &[&str]) -> TriggerConfig {
        TriggerConfig {
            trigger_type: kind,
            branches: branches.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_unconditional_by_default() {
        let evaluator = TriggerEvaluator::new();
        let p = pipeline(vec![]);
        assert!(evaluator.should_run(&p, &TriggerEvent::push("refs/heads/main")));
        assert!(evaluator.should_run(&p, &TriggerEvent::pull_request("refs/pull/7/merge")));
        assert!(evaluator.should_run(&p, &TriggerEvent::tag_push("refs/tags/v0.3.1")));
    }

    #[test]
    fn test_unfiltered_push_and_pr_triggers() {
        let evaluator = TriggerEvaluator::new();
        let p = pipeline(vec![
            trigger(TriggerType::Push, &[], &[]),
            trigger(TriggerType::PullRequest, &[], &[]),
        ]);
        assert!(evaluator.should_run(&p, &TriggerEvent::push("refs/heads/feature/x")));
        assert!(evaluator.should_run(&p, &TriggerEvent::push("refs/tags/v0.3.1")));
        assert!(evaluator.should_run(&p, &TriggerEvent::pull_request("refs/heads/main")));
    }

    #[test]
    fn test_branch_filter() {
        let evaluator = TriggerEvaluator::new();
        let p = pipeline(vec![trigger(TriggerType::Push, &["main", "release/*"], &[])]);
        assert!(evaluator.should_run(&p, &TriggerEvent::push("refs/heads/main")));
        assert!(evaluator.should_run(&p, &TriggerEvent::push("refs/heads/release/1.0")));
        assert!(!evaluator.should_run(&p, &TriggerEvent::push("refs/heads/develop")));
        assert!(!evaluator.should_run(&p, &TriggerEvent::push("refs/tags/v1.0.0")));
        assert!(!evaluator.should_run(&p, &TriggerEvent::pull_request("refs/heads/main")));
    }

    #[test]
    fn test_tag_filter() {
        let evaluator = TriggerEvaluator::new();
        let p = pipeline(vec![trigger(TriggerType::Push, &[], &["v*"])]);
        assert!(evaluator.should_run(&p, &TriggerEvent::push("refs/tags/v0.3.1")));
        assert!(evaluator.should_run(&p, &TriggerEvent::tag_push("refs/tags/v1.0.0")));
        assert!(!evaluator.should_run(&p, &TriggerEvent::push("refs/tags/nightly")));
        assert!(!evaluator.should_run(&p, &TriggerEvent::push("refs/heads/main")));
    }

    #[test]
    fn test_ref_names() {
        assert_eq!(TriggerEvent::push("refs/heads/main").ref_name(), "main");
        assert_eq!(TriggerEvent::push("refs/tags/v0.3.1").tag(), Some("v0.3.1"));
        assert_eq!(TriggerEvent::pull_request("refs/pull/7/merge").ref_name(), "refs/pull/7/merge");
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("feature/*", "feature/foo"));
        assert!(!glob_match("feature/*", "feature/foo/bar"));
        assert!(glob_match("release/**", "release/v1/hotfix"));
        assert!(glob_match("v*.0", "v1.0"));
        assert!(!glob_match("v*v", "v"));
        assert!(glob_match("main", "main"));
    }
}
