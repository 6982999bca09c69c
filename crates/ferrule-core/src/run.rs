//! Run and execution types.

use crate::ids::{InstanceId, RunId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of event that activated a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    TagPush,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::TagPush => "tag_push",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            "tag_push" | "tag-push" | "tag" => Ok(EventKind::TagPush),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// Lifecycle state of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    GatedSkip,
}

impl JobState {
    /// Terminal but not a success: dependents must not run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Skipped | JobState::GatedSkip
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Blocked => "blocked",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::GatedSkip => "gated-skip",
        };
        f.write_str(s)
    }
}

/// Why an instance ended up in its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    Succeeded,
    StepFailed {
        step: String,
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    MissingCredential {
        secret: String,
    },
    ExecutionError {
        message: String,
    },
    SkippedByCondition {
        condition: String,
    },
    DependencyFailed {
        dependency: String,
    },
    DependencySkipped {
        dependency: String,
    },
}

/// Coarse grouping of reasons for the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    Succeeded,
    Failed,
    SkippedByCondition,
    SkippedByPropagation,
}

impl TerminalReason {
    pub fn category(&self) -> ReasonCategory {
        match self {
            TerminalReason::Succeeded => ReasonCategory::Succeeded,
            TerminalReason::StepFailed { .. }
            | TerminalReason::MissingCredential { .. }
            | TerminalReason::ExecutionError { .. } => ReasonCategory::Failed,
            TerminalReason::SkippedByCondition { .. } => ReasonCategory::SkippedByCondition,
            TerminalReason::DependencyFailed { .. } | TerminalReason::DependencySkipped { .. } => {
                ReasonCategory::SkippedByPropagation
            }
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::Succeeded => write!(f, "succeeded"),
            TerminalReason::StepFailed {
                step,
                exit_code: Some(code),
                ..
            } => write!(f, "step `{}` failed with exit code {}", step, code),
            TerminalReason::StepFailed {
                step,
                exit_code: None,
                message,
            } => match message {
                Some(m) => write!(f, "step `{}` failed: {}", step, m),
                None => write!(f, "step `{}` failed", step),
            },
            TerminalReason::MissingCredential { secret } => {
                write!(f, "missing credential `{}`", secret)
            }
            TerminalReason::ExecutionError { message } => write!(f, "execution error: {}", message),
            TerminalReason::SkippedByCondition { condition } => {
                write!(f, "skipped by condition `{}`", condition)
            }
            TerminalReason::DependencyFailed { dependency } => {
                write!(f, "dependency failed: {}", dependency)
            }
            TerminalReason::DependencySkipped { dependency } => {
                write!(f, "dependency skipped: {}", dependency)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Failed, but the step is marked `continue_on_error`.
    FailedIgnored,
    NotRun,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Captured output with the instance's secrets masked.
    #[serde(default)]
    pub output: Vec<String>,
}

impl StepReport {
    pub fn not_run(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::NotRun,
            exit_code: None,
            duration_ms: 0,
            output: Vec::new(),
        }
    }
}

/// Terminal outcome of one job instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InstanceReport {
    pub id: InstanceId,
    pub state: JobState,
    pub reason: TerminalReason,
    #[serde(default)]
    pub steps: Vec<StepReport>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl InstanceReport {
    /// An instance that finished without ever running.
    pub fn not_started(id: InstanceId, state: JobState, reason: TerminalReason) -> Self {
        Self {
            id,
            state,
            reason,
            steps: Vec::new(),
            started_at: None,
            completed_at: Some(Utc::now()),
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    /// Skips are not failures: only a `failed` instance fails the run.
    pub fn aggregate<'a>(instances: impl IntoIterator<Item = &'a InstanceReport>) -> Self {
        if instances
            .into_iter()
            .any(|i| i.state == JobState::Failed)
        {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => f.write_str("succeeded"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_by_condition: usize,
    pub skipped_by_propagation: usize,
}

/// Final report of a run, safe to persist: contains no secret values.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub event: EventKind,
    pub git_ref: String,
    pub status: RunStatus,
    pub instances: Vec<InstanceReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn instance(&self, id: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.id.to_string() == id)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for instance in &self.instances {
            match instance.reason.category() {
                ReasonCategory::Succeeded => summary.succeeded += 1,
                ReasonCategory::Failed => summary.failed += 1,
                ReasonCategory::SkippedByCondition => summary.skipped_by_condition += 1,
                ReasonCategory::SkippedByPropagation => summary.skipped_by_propagation += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: JobState, reason: TerminalReason) -> InstanceReport {
        InstanceReport::not_started(InstanceId::new("job"), state, reason)
    }

    #[test]
    fn test_only_success_releases_dependents() {
        assert!(!JobState::Succeeded.blocks_dependents());
        for state in [JobState::Failed, JobState::Skipped, JobState::GatedSkip] {
            assert!(state.blocks_dependents(), "{state}");
        }
    }

    #[test]
    fn test_skips_do_not_fail_run() {
        let instances = vec![
            report(JobState::Succeeded, TerminalReason::Succeeded),
            report(
                JobState::GatedSkip,
                TerminalReason::SkippedByCondition {
                    condition: "false".into(),
                },
            ),
            report(
                JobState::Skipped,
                TerminalReason::DependencySkipped {
                    dependency: "publish".into(),
                },
            ),
        ];
        assert_eq!(RunStatus::aggregate(&instances), RunStatus::Succeeded);
    }

    #[test]
    fn test_any_failure_fails_run() {
        let instances = vec![
            report(JobState::Succeeded, TerminalReason::Succeeded),
            report(
                JobState::Failed,
                TerminalReason::MissingCredential {
                    secret: "TOKEN".into(),
                },
            ),
        ];
        assert_eq!(RunStatus::aggregate(&instances), RunStatus::Failed);
    }

    #[test]
    fn test_reason_categories_are_distinct() {
        assert_eq!(
            TerminalReason::SkippedByCondition {
                condition: "x".into()
            }
            .category(),
            ReasonCategory::SkippedByCondition
        );
        assert_eq!(
            TerminalReason::DependencyFailed {
                dependency: "b".into()
            }
            .category(),
            ReasonCategory::SkippedByPropagation
        );
        assert_eq!(
            TerminalReason::StepFailed {
                step: "s".into(),
                exit_code: Some(1),
                message: None
            }
            .category(),
            ReasonCategory::Failed
        );
    }

    #[test]
    fn test_reason_display() {
        let reason = TerminalReason::DependencyFailed {
            dependency: "B".into(),
        };
        assert_eq!(reason.to_string(), "dependency failed: B");
        assert_eq!(JobState::GatedSkip.to_string(), "gated-skip");
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!("push".parse::<EventKind>().unwrap(), EventKind::Push);
        assert_eq!("tag-push".parse::<EventKind>().unwrap(), EventKind::TagPush);
        assert!("cron".parse::<EventKind>().is_err());
    }
}
