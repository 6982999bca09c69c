//! DAG resolution for pipeline jobs.
//!
//! Every job template is expanded into its instances and each instance
//! becomes a node. `needs: [b]` on template `a` adds an edge from every
//! instance of `b` to every instance of `a`. Nodes are added in discovery
//! order (job declaration order, then matrix order), so node indices double
//! as the dispatch tie-break.

use crate::gate::{Condition, ConditionError};
use crate::matrix::{JobInstance, MatrixExpander};
use ferrule_core::Error;
use ferrule_core::ids::InstanceId;
use ferrule_core::pipeline::PipelineDefinition;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::debug;

#[derive(Debug, ThisError)]
pub enum DagError {
    #[error(transparent)]
    Definition(#[from] Error),

    #[error("cycle detected in job dependencies: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("job {job} needs unknown job {dependency}")]
    UnknownDependency { job: String, dependency: String },

    #[error("invalid condition on job {job}: {source}")]
    InvalidCondition {
        job: String,
        #[source]
        source: ConditionError,
    },
}

impl From<DagError> for Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::Definition(e) => e,
            DagError::CycleDetected(path) => Error::DependencyCycle(path),
            DagError::UnknownDependency { job, dependency } => {
                Error::UnknownDependency { job, dependency }
            }
            DagError::InvalidCondition { job, source } => Error::InvalidCondition {
                job,
                message: source.to_string(),
            },
        }
    }
}

/// A node in the job graph.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub instance: JobInstance,
    pub condition: Option<Arc<Condition>>,
}

impl DagNode {
    pub fn id(&self) -> &InstanceId {
        &self.instance.id
    }
}

/// Directed acyclic graph of job instances.
#[derive(Debug)]
pub struct JobGraph {
    graph: DiGraph<DagNode, ()>,
    name_to_nodes: HashMap<String, Vec<NodeIndex>>,
}

impl JobGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node indices in discovery order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn node(&self, idx: NodeIndex) -> &DagNode {
        &self.graph[idx]
    }

    /// Instances of one job template.
    pub fn instances_of(&self, job: &str) -> Vec<&DagNode> {
        self.name_to_nodes
            .get(job)
            .map(|indices| indices.iter().map(|&idx| &self.graph[idx]).collect())
            .unwrap_or_default()
    }

    /// Instances that must succeed before `idx` can run, in discovery order.
    pub fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(idx, Direction::Incoming)
    }

    /// Instances waiting on `idx`, in discovery order.
    pub fn dependents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(idx, Direction::Outgoing)
    }

    /// Get topologically sorted instances.
    pub fn topological_order(&self) -> Result<Vec<&DagNode>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| indices.iter().map(|&idx| &self.graph[idx]).collect())
            .map_err(|cycle| {
                DagError::CycleDetected(vec![self.graph[cycle.node_id()].id().to_string()])
            })
    }

    fn sorted_neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, direction)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        neighbors.sort();
        neighbors
    }
}

/// Builder for constructing job graphs.
pub struct DagBuilder {
    expander: MatrixExpander,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self {
            expander: MatrixExpander::new(),
        }
    }

    /// Validate a definition and build its instance graph.
    ///
    /// Any error here means no instance may start.
    pub fn build(&self, pipeline: &PipelineDefinition) -> Result<JobGraph, DagError> {
        pipeline.validate()?;
        detect_cycle(pipeline)?;

        let mut conditions: HashMap<&str, Arc<Condition>> = HashMap::new();
        for job in &pipeline.jobs {
            if let Some(source) = &job.condition {
                let condition =
                    Condition::parse(source).map_err(|source| DagError::InvalidCondition {
                        job: job.name.clone(),
                        source,
                    })?;
                conditions.insert(job.name.as_str(), Arc::new(condition));
            }
        }

        let mut graph = DiGraph::new();
        let mut name_to_nodes: HashMap<String, Vec<NodeIndex>> = HashMap::new();

        // Add all instances as nodes (expanding matrix jobs)
        for job in &pipeline.jobs {
            let indices = name_to_nodes.entry(job.name.clone()).or_default();
            for instance in self.expander.expand(job) {
                let node = DagNode {
                    instance,
                    condition: conditions.get(job.name.as_str()).cloned(),
                };
                indices.push(graph.add_node(node));
            }
            debug!(job = %job.name, instances = indices.len(), "Expanded job");
        }

        // Add edges for dependencies
        for job in &pipeline.jobs {
            let job_indices = name_to_nodes.get(&job.name).cloned().unwrap_or_default();

            for dep in &job.needs {
                let dep_indices =
                    name_to_nodes
                        .get(dep)
                        .ok_or_else(|| DagError::UnknownDependency {
                            job: job.name.clone(),
                            dependency: dep.clone(),
                        })?;

                // Cartesian product: all dependency instances -> all job instances
                for &dep_idx in dep_indices {
                    for &job_idx in &job_indices {
                        graph.update_edge(dep_idx, job_idx, ());
                    }
                }
            }
        }

        let dag = JobGraph {
            graph,
            name_to_nodes,
        };
        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Template-level cycle check, so cycles are caught even when a matrix
/// expands a participant to zero instances.
fn detect_cycle(pipeline: &PipelineDefinition) -> Result<(), DagError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = pipeline
        .jobs
        .iter()
        .map(|job| (job.name.as_str(), graph.add_node(job.name.as_str())))
        .collect();

    for job in &pipeline.jobs {
        for dep in &job.needs {
            if let (Some(&from), Some(&to)) = (index.get(job.name.as_str()), index.get(dep.as_str()))
            {
                // job -> dependency, so a walk reads as "needs".
                graph.update_edge(from, to, ());
            }
        }
    }

    if toposort(&graph, None).is_ok() {
        return Ok(());
    }

    let component = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .min_by_key(|scc| scc.iter().min().copied())
        .unwrap_or_default();

    Err(DagError::CycleDetected(cycle_path(&graph, &component)))
}

/// Walk inside a strongly connected component until a node repeats.
fn cycle_path(graph: &DiGraph<&str, ()>, component: &[NodeIndex]) -> Vec<String> {
    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let Some(&start) = component.iter().min() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = graph
            .neighbors(current)
            .filter(|n| members.contains(n))
            .min();
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&n| n == next) {
            path.drain(..pos);
            path.push(next);
            break;
        }
        path.push(next);
        current = next;
    }

    path.into_iter().map(|idx| graph[idx].to_string()).collect()
}
