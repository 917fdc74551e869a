//! Structured events emitted by the engine.
//!
//! The engine emits and never queries: observability consumers subscribe
//! to this channel and do whatever they like with the stream. Events are
//! emitted best-effort; a slow consumer never blocks the engine.

use crate::bus::MessageType;
use crate::core::subtask::{NodeId, NodeStatus};
use crate::core::task::TaskId;
use crate::executor::{RunId, RunStatus};
use crate::registry::{AgentId, HealthState};
use tokio::sync::mpsc;

/// One structured observability event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A task was accepted for decomposition.
    TaskSubmitted {
        task_id: TaskId,
    },
    /// Decomposition produced a validated DAG.
    DecompositionComplete {
        task_id: TaskId,
        nodes: usize,
    },
    /// A subtask node changed status.
    NodeStateChanged {
        run_id: RunId,
        node_id: NodeId,
        status: NodeStatus,
    },
    /// A quality gate was evaluated.
    GateEvaluated {
        run_id: RunId,
        node_id: NodeId,
        passed: bool,
    },
    /// A workflow run changed status.
    RunStateChanged {
        run_id: RunId,
        status: RunStatus,
    },
    /// A queued message was dropped under backpressure.
    MessageShed {
        subscriber: AgentId,
        message_type: MessageType,
    },
    /// A subscriber's queue crossed the high-water mark.
    DeliveryDegraded {
        subscriber: AgentId,
        queued: usize,
    },
    /// An agent's health state changed.
    HealthChanged {
        agent_id: AgentId,
        from: HealthState,
        to: HealthState,
    },
    /// The self-healing coordinator intervened.
    RecoveryTriggered {
        failed: AgentId,
        replacement: Option<AgentId>,
        node: Option<NodeId>,
    },
}

/// Create an event channel with the given capacity.
pub fn channel(capacity: usize) -> (mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
    mpsc::channel(capacity)
}

/// Best-effort emit that never blocks the engine on a slow consumer.
pub fn emit(tx: &mpsc::Sender<EngineEvent>, event: EngineEvent) {
    if let Err(err) = tx.try_send(event) {
        tracing::trace!(%err, "observability event dropped");
    }
}
