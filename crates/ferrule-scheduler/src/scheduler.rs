//! Dependency-respecting execution of a job graph.
//!
//! Instance lifecycle:
//!
//! ```text
//! pending -> gated-skip                          (gate false)
//! pending -> blocked -> skipped                  (a dependency did not succeed)
//! pending -> blocked -> ready -> running -> succeeded | failed
//! ```
//!
//! Gates are evaluated once for every instance before anything runs. Only a
//! succeeded dependency unblocks a dependent; failed, skipped and gated-skip
//! dependencies skip it by propagation. Ready instances are dispatched in
//! discovery order and run concurrently. Nothing is cancelled: a failure
//! never stops instances that are already running or independent of it.

use crate::dag::JobGraph;
use crate::execution::InstanceExecution;
use crate::gate::ConditionalGate;
use crate::triggers::TriggerEvent;
use chrono::Utc;
use ferrule_core::events::{JobFinishedPayload, JobStartedPayload, RunEvent};
use ferrule_core::ids::RunId;
use ferrule_core::run::{InstanceReport, JobState, TerminalReason};
use ferrule_runner::StepRunner;
use ferrule_secrets::SecretScope;
use futures::FutureExt;
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory steps run in, unless a step sets `working_directory`.
    pub workspace: PathBuf,
    /// Applied to steps without `timeout_minutes`.
    pub default_step_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            default_step_timeout: None,
        }
    }
}

/// Per-run inputs of the scheduler.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub event: TriggerEvent,
    pub pipeline_env: Arc<HashMap<String, String>>,
}

/// Executes a job graph to completion.
pub struct DependencyScheduler {
    runner: Arc<dyn StepRunner>,
    secrets: SecretScope,
    config: SchedulerConfig,
    gate: ConditionalGate,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl DependencyScheduler {
    pub fn new(runner: Arc<dyn StepRunner>, secrets: SecretScope, config: SchedulerConfig) -> Self {
        Self {
            runner,
            secrets,
            config,
            gate: ConditionalGate::new(),
            events: None,
        }
    }

    /// Publish job lifecycle events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Run every instance of `graph` to a terminal state.
    ///
    /// Reports are returned in discovery order, one per instance.
    pub async fn execute(&self, graph: &JobGraph, ctx: &RunContext) -> Vec<InstanceReport> {
        let mut run = RunState::new(graph);

        // Gates are independent of dependency outcomes.
        let mut gated = Vec::new();
        for idx in graph.indices() {
            let node = graph.node(idx);
            if self.gate.evaluate(node.condition.as_deref(), &ctx.event) {
                run.states[idx.index()] = JobState::Blocked;
            } else {
                let condition = node
                    .condition
                    .as_ref()
                    .map(|c| c.source().to_string())
                    .unwrap_or_default();
                info!(instance = %node.id(), condition = %condition, "Gate closed, skipping");
                self.finish(
                    &mut run,
                    ctx,
                    idx,
                    InstanceReport::not_started(
                        node.id().clone(),
                        JobState::GatedSkip,
                        TerminalReason::SkippedByCondition { condition },
                    ),
                );
                gated.push(idx);
            }
        }
        for idx in gated {
            self.propagate(&mut run, graph, ctx, idx);
        }

        let mut tasks = JoinSet::new();
        loop {
            // Dispatch everything that became ready, in discovery order.
            for idx in graph.indices() {
                let i = idx.index();
                if run.states[i] != JobState::Blocked || run.waiting_on[i] > 0 {
                    continue;
                }
                run.states[i] = JobState::Ready;
                self.dispatch(&mut run, &mut tasks, graph, ctx, idx);
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (idx, report) = match joined {
                Ok(done) => done,
                Err(err) => {
                    // Tasks catch their own panics; only cancellation lands here.
                    error!(error = %err, "Job task aborted");
                    continue;
                }
            };

            let blocks = report.state.blocks_dependents();
            self.finish(&mut run, ctx, idx, report);
            if blocks {
                self.propagate(&mut run, graph, ctx, idx);
            } else {
                for dependent in graph.dependents(idx) {
                    run.waiting_on[dependent.index()] -= 1;
                }
            }
        }

        // Anything left over never got a chance to run.
        for idx in graph.indices() {
            if run.reports[idx.index()].is_none() {
                let report = InstanceReport::not_started(
                    graph.node(idx).id().clone(),
                    JobState::Failed,
                    TerminalReason::ExecutionError {
                        message: "instance was never scheduled".to_string(),
                    },
                );
                self.finish(&mut run, ctx, idx, report);
            }
        }

        run.reports.into_iter().flatten().collect()
    }

    fn dispatch(
        &self,
        run: &mut RunState,
        tasks: &mut JoinSet<(NodeIndex, InstanceReport)>,
        graph: &JobGraph,
        ctx: &RunContext,
        idx: NodeIndex,
    ) {
        let node = graph.node(idx);
        run.states[idx.index()] = JobState::Running;
        info!(instance = %node.id(), "Starting job");
        self.emit(RunEvent::JobStarted(JobStartedPayload {
            run_id: ctx.run_id,
            instance: node.id().clone(),
            started_at: Utc::now(),
        }));

        let id = node.id().clone();
        let execution = InstanceExecution {
            run_id: ctx.run_id,
            instance: node.instance.clone(),
            event: ctx.event.clone(),
            pipeline_env: Arc::clone(&ctx.pipeline_env),
            runner: Arc::clone(&self.runner),
            secrets: self.secrets.clone(),
            workspace: self.config.workspace.clone(),
            default_step_timeout: self.config.default_step_timeout,
        };

        tasks.spawn(async move {
            let report = match AssertUnwindSafe(execution.run()).catch_unwind().await {
                Ok(report) => report,
                Err(_) => {
                    error!(instance = %id, "Job task panicked");
                    InstanceReport::not_started(
                        id,
                        JobState::Failed,
                        TerminalReason::ExecutionError {
                            message: "job task panicked".to_string(),
                        },
                    )
                }
            };
            (idx, report)
        });
    }

    /// Skip every blocked instance downstream of a non-successful `origin`.
    fn propagate(&self, run: &mut RunState, graph: &JobGraph, ctx: &RunContext, origin: NodeIndex) {
        let mut queue = vec![origin];
        while let Some(idx) = queue.pop() {
            let cause = graph.node(idx).id().to_string();
            let failed = run.states[idx.index()] == JobState::Failed;

            for dependent in graph.dependents(idx) {
                if run.states[dependent.index()] != JobState::Blocked {
                    continue;
                }
                let reason = if failed {
                    TerminalReason::DependencyFailed {
                        dependency: cause.clone(),
                    }
                } else {
                    TerminalReason::DependencySkipped {
                        dependency: cause.clone(),
                    }
                };
                debug!(instance = %graph.node(dependent).id(), reason = %reason, "Skipping dependent");
                let report = InstanceReport::not_started(
                    graph.node(dependent).id().clone(),
                    JobState::Skipped,
                    reason,
                );
                self.finish(run, ctx, dependent, report);
                queue.push(dependent);
            }
        }
    }

    fn finish(&self, run: &mut RunState, ctx: &RunContext, idx: NodeIndex, report: InstanceReport) {
        let i = idx.index();
        run.states[i] = report.state;
        if report.state == JobState::Failed {
            info!(instance = %report.id, reason = %report.reason, "Job failed");
        } else if report.state == JobState::Succeeded {
            info!(instance = %report.id, duration_ms = ?report.duration_ms, "Job succeeded");
        }
        self.emit(RunEvent::JobFinished(JobFinishedPayload {
            run_id: ctx.run_id,
            instance: report.id.clone(),
            state: report.state,
            reason: report.reason.clone(),
            duration_ms: report.duration_ms,
        }));
        run.reports[i] = Some(report);
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }
}

struct RunState {
    states: Vec<JobState>,
    waiting_on: Vec<usize>,
    reports: Vec<Option<InstanceReport>>,
}

impl RunState {
    fn new(graph: &JobGraph) -> Self {
        Self {
            states: vec![JobState::Pending; graph.len()],
            waiting_on: graph
                .indices()
                .map(|idx| graph.dependencies(idx).len())
                .collect(),
            reports: vec![None; graph.len()],
        }
    }
}
