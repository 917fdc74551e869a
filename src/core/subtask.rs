//! Subtask node data model.
//!
//! Subtask nodes are the vertices of the execution DAG: the atomic units
//! of work assigned to agents. Each node tracks its required
//! capabilities, target hierarchy layer, payloads, and status.

use crate::core::task::TaskId;
use crate::registry::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a subtask node within a DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new unique node identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Capabilities a worker can hold and a node can require.
///
/// Kept as a closed enum rather than free-form strings so that assignment
/// matching stays exhaustive and testable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CodeGeneration,
    CodeReview,
    Testing,
    Research,
    DataAnalysis,
    Writing,
    Planning,
    Integration,
    Deployment,
    Monitoring,
}

impl Capability {
    /// All capabilities, in declaration order.
    pub fn all() -> &'static [Capability] {
        &[
            Capability::CodeGeneration,
            Capability::CodeReview,
            Capability::Testing,
            Capability::Research,
            Capability::DataAnalysis,
            Capability::Writing,
            Capability::Planning,
            Capability::Integration,
            Capability::Deployment,
            Capability::Monitoring,
        ]
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::CodeGeneration => "code_generation",
            Capability::CodeReview => "code_review",
            Capability::Testing => "testing",
            Capability::Research => "research",
            Capability::DataAnalysis => "data_analysis",
            Capability::Writing => "writing",
            Capability::Planning => "planning",
            Capability::Integration => "integration",
            Capability::Deployment => "deployment",
            Capability::Monitoring => "monitoring",
        };
        write!(f, "{}", s)
    }
}

/// Hierarchy tier of an agent or a node's designated worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Top-level oversight; final escalation target.
    Executive,
    /// Coordinates specialists; first escalation target above them.
    Management,
    /// Skilled workers that carry most subtasks.
    Specialist,
    /// Narrow, mechanical workers.
    Execution,
}

impl Layer {
    /// The next layer up for escalation, if any.
    ///
    /// Escalation walks Execution -> Specialist -> Management -> Executive;
    /// executives have nowhere further to go.
    pub fn escalation_target(&self) -> Option<Layer> {
        match self {
            Layer::Execution => Some(Layer::Specialist),
            Layer::Specialist => Some(Layer::Management),
            Layer::Management => Some(Layer::Executive),
            Layer::Executive => None,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Executive => write!(f, "executive"),
            Layer::Management => write!(f, "management"),
            Layer::Specialist => write!(f, "specialist"),
            Layer::Execution => write!(f, "execution"),
        }
    }
}

/// Subtask node status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum NodeStatus {
    /// Node created, upstream dependencies not yet satisfied.
    Pending,
    /// All upstream dependencies completed and gated; schedulable.
    Ready,
    /// An agent accepted the node but has not started.
    Assigned,
    /// An agent is executing the node.
    Running,
    /// Node cannot proceed (for example: no assignment capacity).
    Blocked {
        /// Reason why the node is blocked.
        reason: String,
    },
    /// Node completed successfully.
    Completed,
    /// Node failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Assigned => write!(f, "assigned"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// A single node in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskNode {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// The task this node was decomposed from.
    pub task_id: TaskId,
    /// Short human-readable name.
    pub name: String,
    /// What the node should accomplish.
    pub description: String,
    /// Capabilities an agent must hold to take this node.
    pub required_capabilities: BTreeSet<Capability>,
    /// Hierarchy layer the node is designated for.
    pub layer: Layer,
    /// Estimated effort, used for load balancing.
    pub estimated: Duration,
    /// Input payload handed to the executing agent.
    pub input: serde_json::Value,
    /// Output payload, filled on completion.
    pub output: Option<serde_json::Value>,
    /// Current execution status.
    pub status: NodeStatus,
    /// Agent currently holding the node, if any.
    pub assigned_agent: Option<AgentId>,
    /// How many times execution has been attempted.
    pub attempts: u32,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
    /// When the node last started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubtaskNode {
    /// Create a new pending node for a task.
    pub fn new(task_id: TaskId, name: &str, description: &str, layer: Layer) -> Self {
        Self {
            id: NodeId::new(),
            task_id,
            name: name.to_string(),
            description: description.to_string(),
            required_capabilities: BTreeSet::new(),
            layer,
            estimated: Duration::from_secs(60),
            input: serde_json::Value::Null,
            output: None,
            status: NodeStatus::Pending,
            assigned_agent: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Add a required capability, builder-style.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.required_capabilities.insert(capability);
        self
    }

    /// Set the estimated effort, builder-style.
    pub fn with_estimate(mut self, estimated: Duration) -> Self {
        self.estimated = estimated;
        self
    }

    /// Set the input payload, builder-style.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Mark the node ready for dispatch.
    pub fn mark_ready(&mut self) {
        self.status = NodeStatus::Ready;
    }

    /// Record acceptance by an agent.
    pub fn assign(&mut self, agent_id: AgentId) {
        self.status = NodeStatus::Assigned;
        self.assigned_agent = Some(agent_id);
    }

    /// Start execution, counting the attempt.
    pub fn start(&mut self) {
        self.status = NodeStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Record successful completion with the produced output.
    pub fn complete(&mut self, output: serde_json::Value) {
        self.status = NodeStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    /// Record failure with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = NodeStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the node blocked.
    pub fn block(&mut self, reason: &str) {
        self.status = NodeStatus::Blocked {
            reason: reason.to_string(),
        };
    }

    /// Revert an in-flight node to Ready for re-dispatch.
    ///
    /// Used by the self-healing coordinator after its agent dies, and by
    /// the executor when retrying a failed node. Does not touch any other
    /// node's state.
    pub fn revert_to_ready(&mut self) {
        self.status = NodeStatus::Ready;
        self.assigned_agent = None;
        self.started_at = None;
    }

    /// Check if the node is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            NodeStatus::Completed | NodeStatus::Failed { .. }
        )
    }

    /// Check if the node is currently held by an agent.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, NodeStatus::Assigned | NodeStatus::Running)
    }
}
