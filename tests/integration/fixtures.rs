//! Shared fixtures for the integration suite.
//!
//! Provides an engine harness that wires a scripted brain, worker host,
//! hierarchy manager, healing coordinator, and bus together the same way
//! the binary does, plus proposal builders for common DAG shapes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use foreman::brain::{Proposal, ProposedNode, Reasoning, ScriptedBrain, ScriptedPropose};
use foreman::bus::{Bus, BusConfig};
use foreman::core::dag::ExecutionDAG;
use foreman::core::subtask::{Capability, Layer, NodeId, NodeStatus};
use foreman::core::task::Task;
use foreman::decompose::Decomposer;
use foreman::events::{self, EngineEvent};
use foreman::executor::Executor;
use foreman::healing::HealingCoordinator;
use foreman::hierarchy::HierarchyManager;
use foreman::registry::AgentId;
use foreman::worker::WorkerHost;
use foreman::EngineConfig;

/// A fully wired engine over a scripted brain.
pub struct EngineHarness {
    pub config: EngineConfig,
    pub bus: Bus,
    pub brain: Arc<ScriptedBrain>,
    pub host: Arc<WorkerHost>,
    pub hierarchy: Arc<HierarchyManager>,
    pub health_endpoint: AgentId,
    pub event_tx: mpsc::Sender<EngineEvent>,
    pub event_rx: mpsc::Receiver<EngineEvent>,
}

impl EngineHarness {
    /// Wire up every component the way `main.rs` does, minus the CLI.
    pub fn new(config: EngineConfig) -> Self {
        let (event_tx, event_rx) = events::channel(4096);
        let bus = Bus::new(
            BusConfig {
                queue_high_water: config.queue_high_water,
                escalation_window: config.escalation_window(),
                max_escalation_hops: config.max_escalation_hops,
            },
            event_tx.clone(),
        );
        let brain = Arc::new(ScriptedBrain::new());
        let health_endpoint = AgentId::new();
        let host = Arc::new(WorkerHost::new(
            Arc::clone(&brain) as Arc<dyn Reasoning>,
            bus.clone(),
            health_endpoint,
            config.heartbeat_interval(),
        ));
        let hierarchy = Arc::new(
            HierarchyManager::new(&config, event_tx.clone()).with_spawner(Arc::clone(&host) as _),
        );

        Self {
            config,
            bus,
            brain,
            host,
            hierarchy,
            health_endpoint,
            event_tx,
            event_rx,
        }
    }

    /// Decompose a task description through the scripted proposal.
    pub async fn decompose(&self, proposal: Proposal) -> ExecutionDAG {
        self.brain.push_proposal(ScriptedPropose::Propose(proposal));
        let decomposer = Decomposer::new(
            Arc::clone(&self.brain) as _,
            &self.config,
            self.event_tx.clone(),
        );
        decomposer
            .decompose(&Task::new("integration task", "integration"))
            .await
            .expect("decomposition should succeed")
    }

    /// Create an executor for a DAG against this harness.
    pub async fn executor(&self, dag: ExecutionDAG) -> Executor {
        Executor::new(
            self.config.clone(),
            dag,
            Arc::clone(&self.hierarchy),
            self.bus.clone(),
            self.event_tx.clone(),
        )
        .await
    }

    /// Start the healing coordinator on the harness health endpoint.
    pub async fn start_healing(&self) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let coordinator = HealingCoordinator::new(
            self.config.clone(),
            self.bus.clone(),
            Arc::clone(&self.hierarchy),
            self.health_endpoint,
        );
        let cancel = coordinator.cancel_token();
        let handle = coordinator.start().await;
        (cancel, handle)
    }

    /// Drain every buffered engine event.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Stop background workers and the bus.
    pub async fn teardown(&self) {
        self.host.kill_all().await;
        self.bus.shutdown();
    }
}

/// Tight timeouts so failing tests do not hang the suite.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        node_timeout_secs: 5,
        run_wall_clock_secs: 15,
        node_retries: 3,
        heartbeat_interval_secs: 1,
        ..Default::default()
    }
}

/// A proposed specialist research node depending on earlier indices.
pub fn proposed(name: &str, deps: &[usize]) -> ProposedNode {
    ProposedNode {
        name: name.to_string(),
        description: format!("{} step", name),
        capabilities: [Capability::Research].into_iter().collect(),
        layer: Layer::Specialist,
        estimated_secs: 30,
        depends_on: deps.to_vec(),
    }
}

/// A proposal of fully independent nodes.
pub fn parallel_proposal(names: &[&str]) -> Proposal {
    Proposal {
        nodes: names.iter().map(|name| proposed(name, &[])).collect(),
    }
}

/// Node ids that reached Completed, in the order the executor handled
/// them.
pub fn completion_order(events: &[EngineEvent]) -> Vec<NodeId> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::NodeStateChanged {
                node_id,
                status: NodeStatus::Completed,
                ..
            } => Some(*node_id),
            _ => None,
        })
        .collect()
}

/// Whether any node was observed Blocked at some point.
pub fn saw_blocked_node(events: &[EngineEvent]) -> bool {
    events.iter().any(|event| {
        matches!(
            event,
            EngineEvent::NodeStateChanged {
                status: NodeStatus::Blocked { .. },
                ..
            }
        )
    })
}
