//! Pipeline scheduling and orchestration for Ferrule.
//!
//! The flow for one event is: [`triggers`] decides whether a run exists,
//! [`dag`] expands the definition through [`matrix`] into an instance graph,
//! [`scheduler`] executes it while consulting [`gate`] and the secret scope,
//! and [`controller`] ties these together into a run report.

pub mod controller;
pub mod dag;
pub mod execution;
pub mod gate;
pub mod matrix;
pub mod scheduler;
pub mod triggers;

pub use controller::{PlannedInstance, RunController, RunOutcome, RunPlan};
pub use dag::{DagBuilder, DagError, JobGraph};
pub use gate::{Condition, ConditionError, ConditionalGate};
pub use matrix::{JobInstance, MatrixExpander};
pub use scheduler::{DependencyScheduler, RunContext, SchedulerConfig};
pub use triggers::{TriggerEvaluator, TriggerEvent};
