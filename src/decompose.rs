//! Task decomposition.
//!
//! The decomposer asks the reasoning capability for a candidate subtask
//! plan and is responsible for everything the brain cannot be trusted
//! with: rejecting cycles, rejecting nodes with no capability tags,
//! capping graph size, and bounding retries. It never returns a partial
//! graph.

use crate::brain::{Proposal, Reasoning, TaskBrief};
use crate::config::EngineConfig;
use crate::core::dag::{DependencyKind, ExecutionDAG};
use crate::core::subtask::SubtaskNode;
use crate::core::task::Task;
use crate::error::DecompositionError;
use crate::events::{self, EngineEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Turns one task into a validated execution DAG.
pub struct Decomposer {
    brain: Arc<dyn Reasoning>,
    max_nodes: usize,
    retries: u32,
    timeout: Duration,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl Decomposer {
    /// Create a decomposer over the given brain.
    pub fn new(
        brain: Arc<dyn Reasoning>,
        config: &EngineConfig,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            brain,
            max_nodes: config.max_dag_nodes,
            retries: config.decompose_retries,
            timeout: config.decompose_timeout(),
            event_tx,
        }
    }

    /// Decompose a task into an execution DAG.
    ///
    /// The proposal from the brain is validated; an invalid proposal is
    /// retried once with a simplified brief before surfacing
    /// `InvalidGraph`. An unresponsive brain is retried up to the
    /// configured bound before surfacing `Timeout`.
    pub async fn decompose(
        &self,
        task: &Task,
    ) -> std::result::Result<ExecutionDAG, DecompositionError> {
        if task.description.trim().is_empty() {
            return Err(DecompositionError::Unresolvable);
        }

        let mut last_invalid: Option<String> = None;

        // Two validation passes: full brief, then a simplified one.
        for simplified in [false, true] {
            let brief = TaskBrief {
                task_id: task.id,
                description: task.description.clone(),
                max_nodes: self.max_nodes,
                simplified,
            };

            let proposal = self.propose_with_retries(&brief).await?;

            if proposal.nodes.is_empty() {
                return Err(DecompositionError::Unresolvable);
            }

            match self.build_dag(task, &proposal) {
                Ok(dag) => {
                    tracing::info!(
                        task = %task.id.short(),
                        nodes = dag.node_count(),
                        simplified,
                        "decomposition complete"
                    );
                    events::emit(
                        &self.event_tx,
                        EngineEvent::DecompositionComplete {
                            task_id: task.id,
                            nodes: dag.node_count(),
                        },
                    );
                    return Ok(dag);
                }
                Err(reason) => {
                    tracing::warn!(task = %task.id.short(), %reason, simplified, "invalid proposal");
                    last_invalid = Some(reason);
                }
            }
        }

        Err(DecompositionError::InvalidGraph(
            last_invalid.unwrap_or_else(|| "proposal rejected".to_string()),
        ))
    }

    /// Call `propose`, retrying on timeout up to the configured bound.
    async fn propose_with_retries(
        &self,
        brief: &TaskBrief,
    ) -> std::result::Result<Proposal, DecompositionError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match tokio::time::timeout(self.timeout, self.brain.propose(brief)).await {
                Ok(Ok(proposal)) => return Ok(proposal),
                Ok(Err(err)) => {
                    // A hard brain error is not retried as a timeout; it
                    // surfaces as an invalid graph after validation has
                    // nothing to work with.
                    return Err(DecompositionError::InvalidGraph(err.to_string()));
                }
                Err(_) if attempts <= self.retries => {
                    tracing::warn!(attempt = attempts, "decomposition proposal timed out, retrying");
                }
                Err(_) => return Err(DecompositionError::Timeout(self.timeout)),
            }
        }
    }

    /// Materialize and validate a proposal as an ExecutionDAG.
    fn build_dag(
        &self,
        task: &Task,
        proposal: &Proposal,
    ) -> std::result::Result<ExecutionDAG, String> {
        if proposal.nodes.len() > self.max_nodes {
            return Err(format!(
                "proposal has {} nodes, cap is {}",
                proposal.nodes.len(),
                self.max_nodes
            ));
        }

        let mut dag = ExecutionDAG::new(task.id);
        let mut ids = Vec::with_capacity(proposal.nodes.len());

        for proposed in &proposal.nodes {
            if proposed.capabilities.is_empty() {
                return Err(format!("node {} has no capability tags", proposed.name));
            }
            let mut node = SubtaskNode::new(task.id, &proposed.name, &proposed.description, proposed.layer)
                .with_estimate(Duration::from_secs(proposed.estimated_secs));
            node.required_capabilities = proposed.capabilities.clone();
            ids.push(node.id);
            dag.add_node(node);
        }

        for (index, proposed) in proposal.nodes.iter().enumerate() {
            for &dep in &proposed.depends_on {
                if dep >= ids.len() {
                    return Err(format!(
                        "node {} depends on unknown index {}",
                        proposed.name, dep
                    ));
                }
                dag.add_dependency(&ids[dep], &ids[index], DependencyKind::DataFlow)
                    .map_err(|err| err.to_string())?;
            }
        }

        dag.validate(self.max_nodes).map_err(|err| err.to_string())?;
        Ok(dag)
    }
}
