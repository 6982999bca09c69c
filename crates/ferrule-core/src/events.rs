//! Progress events emitted while a run executes.
//!
//! Events carry identities, states and reasons only; secret values never
//! appear in them.

use crate::ids::{InstanceId, RunId};
use crate::run::{EventKind, JobState, RunStatus, TerminalReason};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted(RunStartedPayload),
    JobStarted(JobStartedPayload),
    JobFinished(JobFinishedPayload),
    RunFinished(RunFinishedPayload),
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted(p) => p.run_id,
            RunEvent::JobStarted(p) => p.run_id,
            RunEvent::JobFinished(p) => p.run_id,
            RunEvent::RunFinished(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub event: EventKind,
    pub git_ref: String,
    pub instances: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub instance: InstanceId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobFinishedPayload {
    pub run_id: RunId,
    pub instance: InstanceId,
    pub state: JobState,
    pub reason: TerminalReason,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunFinishedPayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub duration_ms: u64,
}
