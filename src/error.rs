use crate::core::subtask::NodeId;
use thiserror::Error;

/// Errors surfaced by the task decomposer.
#[derive(Error, Debug)]
pub enum DecompositionError {
    #[error("task description could not be resolved into any subtask")]
    Unresolvable,

    #[error("proposed graph is invalid: {0}")]
    InvalidGraph(String),

    #[error("reasoning capability timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors surfaced by the hierarchy manager during assignment.
#[derive(Error, Debug)]
pub enum AssignmentError {
    #[error("agent pool is at capacity (max: {max}) and no idle candidate exists")]
    NoCapacity { max: usize },

    #[error("assignment vetoed by authorizer for agent {agent}")]
    Unauthorized { agent: crate::registry::AgentId },
}

/// Errors surfaced by the communication bus.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("message shed under backpressure")]
    Shed,

    #[error("no subscriber for recipient: {0}")]
    NoSubscriber(String),
}

/// Errors surfaced by the workflow executor.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("run finished partially: {} completed, {} failed", completed.len(), failed.len())]
    PartialFailure {
        completed: Vec<NodeId>,
        failed: Vec<NodeId>,
    },

    #[error("quality gate rejected output of node {node}")]
    GateRejected { node: NodeId },

    #[error("run was cancelled")]
    Cancelled,
}

/// Errors surfaced by the self-healing coordinator.
#[derive(Error, Debug)]
pub enum HealingError {
    #[error("recovery exceeded budget of {0:?}")]
    RecoveryBudgetExceeded(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("decomposition failed: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("assignment failed: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("workflow failed: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("healing failed: {0}")]
    Healing(#[from] HealingError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Agent not found: {id}")]
    AgentNotFound { id: crate::registry::AgentId },

    #[error("Node not found in DAG: {id}")]
    NodeNotFound { id: NodeId },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Brain binary not found: {0}")]
    BrainBinaryNotFound(String),

    #[error("engine halted: {0}")]
    Halted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
