//! Run orchestration: trigger, graph, schedule, aggregate.

use crate::dag::DagBuilder;
use crate::gate::ConditionalGate;
use crate::scheduler::{DependencyScheduler, RunContext, SchedulerConfig};
use crate::triggers::{TriggerEvaluator, TriggerEvent};
use chrono::Utc;
use ferrule_core::events::{RunEvent, RunFinishedPayload, RunStartedPayload};
use ferrule_core::ids::{InstanceId, RunId};
use ferrule_core::pipeline::PipelineDefinition;
use ferrule_core::run::{EventKind, RunReport, RunStatus};
use ferrule_core::Result;
use ferrule_runner::StepRunner;
use ferrule_secrets::SecretScope;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, instrument};

/// Result of handing an event to the controller.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The triggers rejected the event; no run exists.
    NotTriggered,
    Completed(RunReport),
}

impl RunOutcome {
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::NotTriggered => None,
            RunOutcome::Completed(report) => Some(report),
        }
    }
}

/// One instance of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedInstance {
    pub id: InstanceId,
    /// Instances that must succeed first.
    pub needs: Vec<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Whether the condition lets the instance run for this event.
    pub gate_open: bool,
}

/// What a run would do for an event, without executing anything.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub pipeline_name: String,
    pub event: EventKind,
    pub git_ref: String,
    pub triggered: bool,
    /// Instances in dispatch order.
    pub instances: Vec<PlannedInstance>,
}

/// Drives one pipeline definition from event to run report.
pub struct RunController {
    definition: Arc<PipelineDefinition>,
    runner: Arc<dyn StepRunner>,
    secrets: SecretScope,
    config: SchedulerConfig,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    trigger: TriggerEvaluator,
    dag_builder: DagBuilder,
}

impl RunController {
    pub fn new(
        definition: PipelineDefinition,
        runner: Arc<dyn StepRunner>,
        secrets: SecretScope,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            runner,
            secrets,
            config: SchedulerConfig::default(),
            events: None,
            trigger: TriggerEvaluator::new(),
            dag_builder: DagBuilder::new(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Dry run: trigger decision, instance graph and gate outcomes.
    pub fn plan(&self, event: &TriggerEvent) -> Result<RunPlan> {
        let triggered = self.trigger.should_run(&self.definition, event);
        let graph = self.dag_builder.build(&self.definition)?;
        let gate = ConditionalGate::new();

        let instances = graph
            .indices()
            .map(|idx| {
                let node = graph.node(idx);
                PlannedInstance {
                    id: node.id().clone(),
                    needs: graph
                        .dependencies(idx)
                        .into_iter()
                        .map(|dep| graph.node(dep).id().clone())
                        .collect(),
                    condition: node.condition.as_ref().map(|c| c.source().to_string()),
                    gate_open: gate.evaluate(node.condition.as_deref(), event),
                }
            })
            .collect();

        Ok(RunPlan {
            pipeline_name: self.definition.name.clone(),
            event: event.kind,
            git_ref: event.git_ref.clone(),
            triggered,
            instances,
        })
    }

    /// Execute the pipeline for `event`.
    ///
    /// A malformed or cyclic definition is an error and no instance starts.
    #[instrument(skip(self, event), fields(pipeline = %self.definition.name, event = %event.kind, git_ref = %event.git_ref))]
    pub async fn execute(&self, event: &TriggerEvent) -> Result<RunOutcome> {
        if !self.trigger.should_run(&self.definition, event) {
            info!("Event does not match any trigger");
            return Ok(RunOutcome::NotTriggered);
        }

        let graph = self.dag_builder.build(&self.definition)?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(run_id = %run_id, instances = graph.len(), "Run started");
        self.emit(RunEvent::RunStarted(RunStartedPayload {
            run_id,
            pipeline_name: self.definition.name.clone(),
            event: event.kind,
            git_ref: event.git_ref.clone(),
            instances: graph.len(),
            started_at,
        }));

        let mut scheduler =
            DependencyScheduler::new(Arc::clone(&self.runner), self.secrets.clone(), self.config.clone());
        if let Some(tx) = &self.events {
            scheduler = scheduler.with_events(tx.clone());
        }

        let ctx = RunContext {
            run_id,
            event: event.clone(),
            pipeline_env: Arc::new(self.definition.env.clone()),
        };
        let instances = scheduler.execute(&graph, &ctx).await;

        let status = RunStatus::aggregate(&instances);
        let duration_ms = start.elapsed().as_millis() as u64;
        let report = RunReport {
            run_id,
            pipeline_name: self.definition.name.clone(),
            event: event.kind,
            git_ref: event.git_ref.clone(),
            status,
            instances,
            started_at,
            completed_at: Utc::now(),
            duration_ms,
        };

        let summary = report.summary();
        info!(
            run_id = %run_id,
            status = %status,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_by_condition = summary.skipped_by_condition,
            skipped_by_propagation = summary.skipped_by_propagation,
            duration_ms,
            "Run finished"
        );
        self.emit(RunEvent::RunFinished(RunFinishedPayload {
            run_id,
            status,
            duration_ms,
        }));

        Ok(RunOutcome::Completed(report))
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
