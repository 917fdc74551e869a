//! Agent registry.
//!
//! The registry is an arena of agent records with stable ids, indexed by
//! hierarchy layer. It is mutated only through the hierarchy manager and
//! the self-healing coordinator; the executor reads assignments but never
//! writes here.

use crate::core::subtask::{Capability, Layer, SubtaskNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Weight of the newest outcome in the completion-rate moving statistic.
const COMPLETION_RATE_ALPHA: f64 = 0.3;

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Create a new unique agent identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Health state of an agent.
///
/// Healthy -> Degraded -> Unresponsive are driven by heartbeat silence;
/// Replaced is terminal and set only by the self-healing coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    /// Missed heartbeats; deprioritized for new work but still serving.
    Degraded,
    /// Considered dead; triggers self-healing.
    Unresponsive,
    /// Recycled by the self-healing coordinator. Terminal.
    Replaced,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unresponsive => write!(f, "unresponsive"),
            HealthState::Replaced => write!(f, "replaced"),
        }
    }
}

/// Descriptor of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique identifier for this agent.
    pub id: AgentId,
    /// Hierarchy tier the agent serves at.
    pub layer: Layer,
    /// Capabilities the agent offers.
    pub capabilities: BTreeSet<Capability>,
    /// Nodes currently held.
    pub load: usize,
    /// Maximum concurrent nodes the agent will accept.
    pub max_concurrency: usize,
    /// Current health state.
    pub health: HealthState,
    /// When the agent last sent a heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Moving success rate of completed assignments, in [0, 1].
    pub completion_rate: f64,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Create a healthy, idle agent record.
    pub fn new(layer: Layer, capabilities: BTreeSet<Capability>, max_concurrency: usize) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            layer,
            capabilities,
            load: 0,
            max_concurrency,
            health: HealthState::Healthy,
            last_heartbeat: now,
            completion_rate: 1.0,
            created_at: now,
        }
    }

    /// Check whether the agent can take the given node: layer match,
    /// capability superset, spare concurrency, and a non-dead health
    /// state. Degraded agents remain eligible, just deprioritized.
    pub fn can_take(&self, node: &SubtaskNode) -> bool {
        self.is_alive()
            && self.layer == node.layer
            && self.load < self.max_concurrency
            && node
                .required_capabilities
                .iter()
                .all(|c| self.capabilities.contains(c))
    }

    /// Whether the agent is still serving (not Unresponsive/Replaced).
    pub fn is_alive(&self) -> bool {
        matches!(self.health, HealthState::Healthy | HealthState::Degraded)
    }

    /// Record a heartbeat, restoring Degraded agents to Healthy.
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
        if self.health == HealthState::Degraded {
            self.health = HealthState::Healthy;
        }
    }

    /// Fold one assignment outcome into the completion-rate statistic.
    pub fn record_outcome(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.completion_rate =
            COMPLETION_RATE_ALPHA * outcome + (1.0 - COMPLETION_RATE_ALPHA) * self.completion_rate;
    }

    /// Silence since the last heartbeat.
    pub fn heartbeat_silence(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }
}

/// A health transition observed during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub agent_id: AgentId,
    pub from: HealthState,
    pub to: HealthState,
}

/// Serializable snapshot of the registry for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub agents: Vec<AgentRecord>,
}

/// Arena of agent records with a layer index.
#[derive(Debug, Default)]
pub struct Registry {
    agents: HashMap<AgentId, AgentRecord>,
    by_layer: HashMap<Layer, HashSet<AgentId>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning its id.
    pub fn insert(&mut self, record: AgentRecord) -> AgentId {
        let id = record.id;
        self.by_layer.entry(record.layer).or_default().insert(id);
        self.agents.insert(id, record);
        id
    }

    /// Remove a record.
    pub fn remove(&mut self, id: &AgentId) -> Option<AgentRecord> {
        let record = self.agents.remove(id)?;
        if let Some(set) = self.by_layer.get_mut(&record.layer) {
            set.remove(id);
        }
        Some(record)
    }

    /// Get a record by id.
    pub fn get(&self, id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    /// Get a mutable record by id.
    pub fn get_mut(&mut self, id: &AgentId) -> Option<&mut AgentRecord> {
        self.agents.get_mut(id)
    }

    /// Number of records, dead ones included.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Number of alive records.
    pub fn alive_count(&self) -> usize {
        self.agents.values().filter(|a| a.is_alive()).count()
    }

    /// Iterate over all records.
    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    /// Candidates able to take the given node, via the layer index.
    pub fn candidates(&self, node: &SubtaskNode) -> Vec<&AgentRecord> {
        self.by_layer
            .get(&node.layer)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.agents.get(id))
                    .filter(|a| a.can_take(node))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sweep heartbeat silence against the configured thresholds.
    ///
    /// Healthy agents silent beyond `degraded_after` become Degraded;
    /// agents silent beyond `unresponsive_after` become Unresponsive.
    /// Returns the transitions that occurred, for the health monitor to
    /// publish.
    pub fn sweep_health(
        &mut self,
        degraded_after: Duration,
        unresponsive_after: Duration,
    ) -> Vec<HealthTransition> {
        let now = Utc::now();
        let mut transitions = Vec::new();

        for record in self.agents.values_mut() {
            let silence = record.heartbeat_silence(now);
            let next = match record.health {
                HealthState::Healthy if silence >= unresponsive_after => {
                    Some(HealthState::Unresponsive)
                }
                HealthState::Healthy if silence >= degraded_after => Some(HealthState::Degraded),
                HealthState::Degraded if silence >= unresponsive_after => {
                    Some(HealthState::Unresponsive)
                }
                _ => None,
            };

            if let Some(to) = next {
                transitions.push(HealthTransition {
                    agent_id: record.id,
                    from: record.health,
                    to,
                });
                record.health = to;
            }
        }

        transitions
    }

    /// Mark an agent Replaced. Terminal; only the healing path calls this.
    pub fn mark_replaced(&mut self, id: &AgentId) {
        if let Some(record) = self.agents.get_mut(id) {
            record.health = HealthState::Replaced;
            record.load = 0;
        }
    }

    /// Produce a serializable snapshot.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            agents: self.agents.values().cloned().collect(),
        }
    }

    /// Rebuild a registry from a snapshot.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let mut registry = Self::new();
        for record in snapshot.agents {
            registry.insert(record);
        }
        registry
    }
}
