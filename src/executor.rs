//! Workflow executor.
//!
//! One executor drives one workflow run: it walks the DAG, asks the
//! hierarchy manager for an assignment per ready node, dispatches
//! assignments over the bus, applies quality gates on completion, and
//! aggregates outputs. All node status transitions happen here, on a
//! single task, so the dependency-satisfaction check is race-free per
//! run while independent runs proceed fully in parallel.

use crate::brain::WorkOrder;
use crate::bus::{Bus, CorrelationId, Message, MessageType, Subscription};
use crate::config::EngineConfig;
use crate::core::dag::ExecutionDAG;
use crate::core::subtask::{Layer, NodeId, NodeStatus};
use crate::core::task::TaskId;
use crate::error::{AssignmentError, WorkflowError};
use crate::events::{self, EngineEvent};
use crate::hierarchy::HierarchyManager;
use crate::registry::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How often the executor re-attempts dispatch while nodes sit blocked
/// on capacity held by other runs.
const BLOCKED_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but not yet started.
    #[default]
    Pending,
    /// Nodes are executing.
    Running,
    /// Nothing in flight; at least one node waits on capacity.
    Blocked,
    /// All nodes done; final gate review in progress.
    QualityReview,
    /// Run finished successfully.
    Completed,
    /// Run failed terminally.
    Failed,
    /// Run was cancelled by the task owner.
    Cancelled,
}

impl RunStatus {
    /// Check if the run has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Blocked => write!(f, "blocked"),
            RunStatus::QualityReview => write!(f, "quality_review"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One self-healing intervention recorded on a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    /// When the intervention happened.
    pub at: DateTime<Utc>,
    /// The agent that died.
    pub failed: AgentId,
    /// Its replacement, when one was obtained in time.
    pub replacement: Option<AgentId>,
    /// The node that was re-addressed.
    pub node: NodeId,
    /// Whether the recovery landed within its budget.
    pub within_budget: bool,
}

/// Execution-time state of one DAG traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier for this run.
    pub id: RunId,
    /// The task being executed.
    pub task_id: TaskId,
    /// Current run status.
    pub status: RunStatus,
    /// Last observed status per node, for reporting and persistence.
    pub node_status: HashMap<NodeId, NodeStatus>,
    /// Aggregated result, set on a terminal status. On failure this
    /// carries the partial outputs so their value is not lost.
    pub result: Option<serde_json::Value>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Self-healing interventions during this run.
    pub recovery_log: Vec<RecoveryEvent>,
}

impl WorkflowRun {
    /// Create a pending run for a task.
    pub fn new(task_id: TaskId) -> Self {
        Self {
            id: RunId::new(),
            task_id,
            status: RunStatus::Pending,
            node_status: HashMap::new(),
            result: None,
            started_at: None,
            ended_at: None,
            recovery_log: Vec::new(),
        }
    }

    /// Check if a transition to the target status is valid.
    pub fn can_transition(&self, target: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self.status, target),
            (Pending, Running)
                | (Running, Blocked)
                | (Blocked, Running)
                | (Running, QualityReview)
                | (QualityReview, Running)
                | (QualityReview, Completed)
                | (Running, Failed)
                | (Blocked, Failed)
                | (QualityReview, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Blocked, Cancelled)
                | (QualityReview, Cancelled)
        )
    }

    /// Transition to a new status.
    ///
    /// Returns whether a transition happened. Same-status is a no-op;
    /// an invalid transition is refused and logged, never panics.
    pub fn transition(&mut self, target: RunStatus) -> bool {
        if self.status == target {
            return false;
        }
        if !self.can_transition(target) {
            tracing::warn!(from = %self.status, to = %target, "refused run transition");
            return false;
        }
        self.status = target;
        if target == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if target.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }
}

/// Payload of a `ReplacementNotice` from the healing coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementNotice {
    pub failed: AgentId,
    pub replacement: Option<AgentId>,
    pub within_budget: bool,
}

/// Drives one workflow run to a terminal status.
pub struct Executor {
    config: EngineConfig,
    dag: ExecutionDAG,
    run: WorkflowRun,
    hierarchy: Arc<HierarchyManager>,
    bus: Bus,
    endpoint: AgentId,
    subscription: Subscription,
    /// Nodes completed with every covering gate passed.
    satisfied: HashSet<NodeId>,
    /// Node -> agent currently holding it.
    in_flight: HashMap<NodeId, AgentId>,
    /// Per-node execution deadlines.
    node_deadlines: HashMap<NodeId, Instant>,
    /// Dedup keys of already-handled messages (at-least-once delivery).
    seen: HashSet<(CorrelationId, MessageType)>,
    /// Set when a node exhausts retries; ends the run.
    fatal: Option<String>,
    /// Set when a gate rejection is configured to fail the whole run.
    gate_rejected: Option<NodeId>,
    event_tx: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl Executor {
    /// Create an executor for a DAG, registering its bus endpoint.
    pub async fn new(
        config: EngineConfig,
        dag: ExecutionDAG,
        hierarchy: Arc<HierarchyManager>,
        bus: Bus,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Self {
        let endpoint = AgentId::new();
        let subscription = bus
            .subscribe(
                endpoint,
                Layer::Executive,
                &[
                    MessageType::TaskResult,
                    MessageType::FailureNotice,
                    MessageType::ReplacementNotice,
                    MessageType::CancellationAck,
                ],
            )
            .await;
        bus.set_failure_sink(endpoint).await;

        let run = WorkflowRun::new(dag.task_id());

        Self {
            config,
            dag,
            run,
            hierarchy,
            bus,
            endpoint,
            subscription,
            satisfied: HashSet::new(),
            in_flight: HashMap::new(),
            node_deadlines: HashMap::new(),
            seen: HashSet::new(),
            fatal: None,
            gate_rejected: None,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// The run state, for reporting and persistence.
    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    /// The DAG being executed.
    pub fn dag(&self) -> &ExecutionDAG {
        &self.dag
    }

    /// The executor's bus endpoint id.
    pub fn endpoint(&self) -> AgentId {
        self.endpoint
    }

    /// Token that cancels this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the DAG to a terminal status.
    ///
    /// Returns the aggregated output on success. On failure the partial
    /// outputs are preserved on the run and inside the error.
    pub async fn execute(&mut self) -> std::result::Result<serde_json::Value, WorkflowError> {
        self.set_run_status(RunStatus::Running);
        let wall_deadline = Instant::now() + self.config.run_wall_clock();

        loop {
            if self.dag.all_satisfied(&self.satisfied) {
                return self.finish_completed().await;
            }

            self.dispatch_ready().await;

            if let Some(reason) = self.fatal.take() {
                return self.finish_partial(&reason).await;
            }

            if self.in_flight.is_empty() {
                if self.has_blocked_nodes() {
                    self.set_run_status(RunStatus::Blocked);
                } else if !self.dag.all_satisfied(&self.satisfied) {
                    // Nothing runs, nothing waits on capacity, nothing is
                    // ready: the remaining nodes are unreachable.
                    return self.finish_partial("no schedulable nodes remain").await;
                }
            } else {
                self.set_run_status(RunStatus::Running);
            }

            if self.dag.all_satisfied(&self.satisfied) {
                return self.finish_completed().await;
            }

            let next_deadline = self
                .node_deadlines
                .iter()
                .min_by_key(|(_, deadline)| **deadline)
                .map(|(id, deadline)| (*id, *deadline));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.finish_cancelled().await;
                }
                _ = tokio::time::sleep_until(wall_deadline) => {
                    return self.finish_partial("run wall clock exceeded").await;
                }
                _ = tokio::time::sleep_until(next_deadline.map(|(_, d)| d).unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if next_deadline.is_some() => {
                    if let Some((node_id, _)) = next_deadline {
                        self.handle_node_timeout(node_id).await;
                    }
                }
                _ = tokio::time::sleep(BLOCKED_RETRY_INTERVAL), if self.in_flight.is_empty() => {
                    // Wake to re-attempt dispatch: capacity held by other
                    // runs frees without any message reaching this run.
                }
                message = self.subscription.recv() => {
                    self.handle_message(message).await;
                }
            }

            if let Some(reason) = self.fatal.take() {
                return self.finish_partial(&reason).await;
            }
        }
    }

    // ========== Dispatch ==========

    async fn dispatch_ready(&mut self) {
        let ready: Vec<NodeId> = self
            .dag
            .ready_nodes(&self.satisfied)
            .into_iter()
            .map(|node| node.id)
            .collect();

        for node_id in ready {
            match self.try_dispatch(node_id).await {
                Ok(()) => {}
                Err(AssignmentError::NoCapacity { .. }) => {
                    if let Some(node) = self.dag.get_node_mut(&node_id) {
                        if !matches!(node.status, NodeStatus::Blocked { .. }) {
                            node.block("no assignment capacity");
                            self.note_node_status(node_id);
                        }
                    }
                }
                Err(AssignmentError::Unauthorized { .. }) => {
                    self.handle_node_failure(node_id, "assignment unauthorized")
                        .await;
                }
            }
        }
    }

    async fn try_dispatch(
        &mut self,
        node_id: NodeId,
    ) -> std::result::Result<(), AssignmentError> {
        let order = {
            let node = match self.dag.get_node(&node_id) {
                Some(node) => node,
                None => return Ok(()),
            };
            WorkOrder {
                node_id,
                task_id: node.task_id,
                name: node.name.clone(),
                description: node.description.clone(),
                input: self.compose_input(&node_id),
            }
        };

        let node_snapshot = match self.dag.get_node(&node_id) {
            Some(node) => node.clone(),
            None => return Ok(()),
        };
        let agent_id = self.hierarchy.assign(&node_snapshot).await?;

        // Stale result from a previous attempt must not satisfy this one.
        self.forget_correlation(node_id);

        if let Some(node) = self.dag.get_node_mut(&node_id) {
            node.assign(agent_id);
            node.start();
        }
        self.in_flight.insert(node_id, agent_id);
        self.node_deadlines
            .insert(node_id, Instant::now() + self.config.node_timeout());
        self.note_node_status(node_id);

        let payload = match serde_json::to_value(&order) {
            Ok(payload) => payload,
            Err(err) => {
                self.hierarchy.release(&agent_id, false).await;
                self.in_flight.remove(&node_id);
                self.node_deadlines.remove(&node_id);
                self.handle_node_failure(node_id, &format!("unserializable order: {}", err))
                    .await;
                return Ok(());
            }
        };

        let assignment = Message::to_agent(
            MessageType::TaskAssignment,
            self.endpoint,
            agent_id,
            CorrelationId::from_node(node_id),
            payload,
        );

        if let Err(err) = self.bus.send(assignment).await {
            tracing::warn!(node = %node_id.short(), %err, "assignment undeliverable");
            self.hierarchy.release(&agent_id, false).await;
            self.in_flight.remove(&node_id);
            self.node_deadlines.remove(&node_id);
            self.handle_node_failure(node_id, "assignment undeliverable").await;
        }
        Ok(())
    }

    /// Merge upstream outputs into a node's input payload.
    fn compose_input(&self, node_id: &NodeId) -> serde_json::Value {
        let node = match self.dag.get_node(node_id) {
            Some(node) => node,
            None => return serde_json::Value::Null,
        };
        let mut upstream = serde_json::Map::new();
        for dep in self.dag.dependencies_of(node_id) {
            if let Some(output) = &dep.output {
                upstream.insert(dep.name.clone(), output.clone());
            }
        }
        if upstream.is_empty() {
            node.input.clone()
        } else {
            serde_json::json!({
                "input": node.input,
                "upstream": upstream,
            })
        }
    }

    // ========== Message handling ==========

    async fn handle_message(&mut self, message: Message) {
        // At-least-once delivery: drop duplicates of anything handled.
        if !self.seen.insert(message.dedup_key()) {
            tracing::debug!(corr = %message.correlation, ty = ?message.message_type, "duplicate message dropped");
            return;
        }

        match message.message_type {
            MessageType::TaskResult => self.handle_result(message).await,
            MessageType::FailureNotice => self.handle_failure_notice(message).await,
            MessageType::ReplacementNotice => self.handle_replacement(message).await,
            other => {
                tracing::trace!(ty = ?other, "executor ignoring message");
            }
        }
    }

    async fn handle_result(&mut self, message: Message) {
        let node_id = NodeId(message.correlation.0);
        let agent_id = match self.in_flight.get(&node_id) {
            Some(agent_id) => *agent_id,
            None => {
                tracing::debug!(node = %node_id.short(), "late or unknown result ignored");
                self.seen.remove(&message.dedup_key());
                return;
            }
        };
        if message.sender != agent_id {
            tracing::debug!(
                node = %node_id.short(),
                sender = %message.sender.short(),
                "result from superseded agent ignored"
            );
            // Not a handled message; the current agent's result must not
            // look like a duplicate.
            self.seen.remove(&message.dedup_key());
            return;
        }

        self.in_flight.remove(&node_id);
        self.node_deadlines.remove(&node_id);
        self.hierarchy.release(&agent_id, true).await;

        if let Some(node) = self.dag.get_node_mut(&node_id) {
            node.complete(message.payload.clone());
        }
        self.note_node_status(node_id);

        // Gate review for this node's output.
        let mut rejected = false;
        for gate in self.dag.gates_for(&node_id) {
            let passed = gate.evaluate(&message.payload);
            events::emit(
                &self.event_tx,
                EngineEvent::GateEvaluated {
                    run_id: self.run.id,
                    node_id,
                    passed,
                },
            );
            if !passed {
                tracing::warn!(node = %node_id.short(), gate = %gate.id.short(), "gate rejected output");
                rejected = true;
            }
        }

        if rejected {
            if self.config.fail_run_on_gate_reject {
                if let Some(node) = self.dag.get_node_mut(&node_id) {
                    node.fail("quality gate rejected output");
                }
                self.note_node_status(node_id);
                self.gate_rejected = Some(node_id);
                self.fatal = Some(format!("quality gate rejected node {}", node_id.short()));
            } else {
                self.handle_node_failure(node_id, "quality gate rejected output")
                    .await;
            }
            return;
        }

        self.satisfied.insert(node_id);
        self.dispatch_ready().await;
    }

    async fn handle_failure_notice(&mut self, message: Message) {
        let node_id = NodeId(message.correlation.0);
        if !self.dag.contains_node(&node_id) {
            tracing::debug!(corr = %message.correlation, "failure notice for unknown correlation");
            return;
        }

        if let Some(agent_id) = self.in_flight.get(&node_id).copied() {
            if message.sender != agent_id
                && matches!(self.dag.get_node(&node_id), Some(n) if n.assigned_agent != Some(message.sender))
            {
                tracing::debug!(node = %node_id.short(), "failure notice from superseded agent ignored");
                self.seen.remove(&message.dedup_key());
                return;
            }
            self.in_flight.remove(&node_id);
            self.node_deadlines.remove(&node_id);
            self.hierarchy.release(&agent_id, false).await;
        }

        let reason = message
            .payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("worker reported failure")
            .to_string();

        self.handle_node_failure(node_id, &reason).await;
    }

    async fn handle_replacement(&mut self, message: Message) {
        let notice: ReplacementNotice = match serde_json::from_value(message.payload.clone()) {
            Ok(notice) => notice,
            Err(err) => {
                tracing::warn!(%err, "malformed replacement notice");
                return;
            }
        };

        let affected: Vec<NodeId> = self
            .in_flight
            .iter()
            .filter(|(_, agent)| **agent == notice.failed)
            .map(|(node, _)| *node)
            .collect();

        for node_id in affected {
            self.run.recovery_log.push(RecoveryEvent {
                at: Utc::now(),
                failed: notice.failed,
                replacement: notice.replacement,
                node: node_id,
                within_budget: notice.within_budget,
            });
            events::emit(
                &self.event_tx,
                EngineEvent::RecoveryTriggered {
                    failed: notice.failed,
                    replacement: notice.replacement,
                    node: Some(node_id),
                },
            );

            self.in_flight.remove(&node_id);
            self.node_deadlines.remove(&node_id);

            if notice.within_budget && notice.replacement.is_some() {
                // Only the affected node reverts; the rest of the DAG is
                // untouched.
                self.forget_correlation(node_id);
                if let Some(node) = self.dag.get_node_mut(&node_id) {
                    node.revert_to_ready();
                }
                self.note_node_status(node_id);
            } else {
                let reason = if notice.within_budget {
                    "agent lost with no replacement available"
                } else {
                    "recovery budget exceeded"
                };
                self.handle_node_failure(node_id, reason).await;
            }
        }

        self.dispatch_ready().await;
    }

    async fn handle_node_timeout(&mut self, node_id: NodeId) {
        let agent_id = match self.in_flight.remove(&node_id) {
            Some(agent_id) => agent_id,
            None => {
                self.node_deadlines.remove(&node_id);
                return;
            }
        };
        self.node_deadlines.remove(&node_id);
        tracing::warn!(node = %node_id.short(), agent = %agent_id.short(), "node execution timed out");

        self.hierarchy.release(&agent_id, false).await;

        // Best effort; the agent is not guaranteed to stop instantly.
        let cancellation = Message::to_agent(
            MessageType::Cancellation,
            self.endpoint,
            agent_id,
            CorrelationId::from_node(node_id),
            serde_json::json!({"reason": "node timeout"}),
        );
        let _ = self.bus.send(cancellation).await;

        self.handle_node_failure(node_id, "node execution timed out")
            .await;
    }

    /// Shared failure path: retry within bounds or end the run.
    async fn handle_node_failure(&mut self, node_id: NodeId, reason: &str) {
        self.in_flight.remove(&node_id);
        self.node_deadlines.remove(&node_id);
        self.forget_correlation(node_id);

        let attempts = match self.dag.get_node(&node_id) {
            Some(node) => node.attempts,
            None => return,
        };

        if attempts < self.config.node_retries {
            tracing::info!(node = %node_id.short(), attempts, %reason, "retrying node");
            if let Some(node) = self.dag.get_node_mut(&node_id) {
                node.revert_to_ready();
            }
            self.note_node_status(node_id);
        } else {
            tracing::error!(node = %node_id.short(), attempts, %reason, "node exhausted retries");
            if let Some(node) = self.dag.get_node_mut(&node_id) {
                node.fail(reason);
            }
            self.note_node_status(node_id);
            self.fatal = Some(format!("node {} failed: {}", node_id.short(), reason));
        }
    }

    // ========== Terminal paths ==========

    async fn finish_completed(
        &mut self,
    ) -> std::result::Result<serde_json::Value, WorkflowError> {
        self.set_run_status(RunStatus::QualityReview);
        // Per-node gates were evaluated on completion; reaching here
        // means every one of them passed.
        let output = self.aggregate_outputs();
        self.run.result = Some(output.clone());
        self.set_run_status(RunStatus::Completed);
        self.bus.unsubscribe(&self.endpoint).await;
        tracing::info!(run = %self.run.id.short(), "run completed");
        Ok(output)
    }

    async fn finish_partial(
        &mut self,
        reason: &str,
    ) -> std::result::Result<serde_json::Value, WorkflowError> {
        // Free agents still holding nodes of this dead run.
        for (node_id, agent_id) in self.in_flight.clone() {
            let cancellation = Message::to_agent(
                MessageType::Cancellation,
                self.endpoint,
                agent_id,
                CorrelationId::from_node(node_id),
                serde_json::json!({"reason": reason}),
            );
            let _ = self.bus.send(cancellation).await;
            self.hierarchy.release(&agent_id, false).await;
        }
        self.in_flight.clear();
        self.node_deadlines.clear();

        let completed: Vec<NodeId> = self.satisfied.iter().copied().collect();
        let failed: Vec<NodeId> = self
            .dag
            .all_nodes()
            .iter()
            .filter(|node| !self.satisfied.contains(&node.id))
            .map(|node| node.id)
            .collect();

        let partial = self.aggregate_outputs();
        self.run.result = Some(partial);
        self.set_run_status(RunStatus::Failed);
        self.bus.unsubscribe(&self.endpoint).await;
        tracing::warn!(run = %self.run.id.short(), %reason, "run failed");

        // Partial outputs stay on the run record either way.
        Err(match self.gate_rejected.take() {
            Some(node) => WorkflowError::GateRejected { node },
            None => WorkflowError::PartialFailure { completed, failed },
        })
    }

    async fn finish_cancelled(
        &mut self,
    ) -> std::result::Result<serde_json::Value, WorkflowError> {
        // Best-effort cancellation to every agent still holding a node.
        for (node_id, agent_id) in self.in_flight.clone() {
            let cancellation = Message::to_agent(
                MessageType::Cancellation,
                self.endpoint,
                agent_id,
                CorrelationId::from_node(node_id),
                serde_json::json!({"reason": "run cancelled"}),
            );
            let _ = self.bus.send(cancellation).await;
            self.hierarchy.release(&agent_id, false).await;
        }
        self.in_flight.clear();
        self.node_deadlines.clear();

        self.run.result = Some(self.aggregate_outputs());
        self.set_run_status(RunStatus::Cancelled);
        // Dropping the endpoint means late results bounce off the bus
        // instead of accumulating for a dead run.
        self.bus.unsubscribe(&self.endpoint).await;
        tracing::info!(run = %self.run.id.short(), "run cancelled");

        Err(WorkflowError::Cancelled)
    }

    /// Aggregate completed node outputs keyed by node name.
    fn aggregate_outputs(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for node in self.dag.all_nodes() {
            if let (true, Some(output)) = (self.satisfied.contains(&node.id), &node.output) {
                map.insert(node.name.clone(), output.clone());
            }
        }
        serde_json::Value::Object(map)
    }

    // ========== Bookkeeping ==========

    fn has_blocked_nodes(&self) -> bool {
        self.dag
            .all_nodes()
            .iter()
            .any(|node| matches!(node.status, NodeStatus::Blocked { .. }))
    }

    fn set_run_status(&mut self, status: RunStatus) {
        if self.run.transition(status) {
            events::emit(
                &self.event_tx,
                EngineEvent::RunStateChanged {
                    run_id: self.run.id,
                    status,
                },
            );
        }
    }

    fn note_node_status(&mut self, node_id: NodeId) {
        if let Some(node) = self.dag.get_node(&node_id) {
            self.run.node_status.insert(node_id, node.status.clone());
            events::emit(
                &self.event_tx,
                EngineEvent::NodeStateChanged {
                    run_id: self.run.id,
                    node_id,
                    status: node.status.clone(),
                },
            );
        }
    }

    /// Drop dedup state for a node so a fresh attempt's messages are not
    /// mistaken for duplicates.
    fn forget_correlation(&mut self, node_id: NodeId) {
        let correlation = CorrelationId::from_node(node_id);
        self.seen
            .retain(|(seen_correlation, _)| *seen_correlation != correlation);
    }
}
