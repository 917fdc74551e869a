//! Agent hierarchy manager.
//!
//! All registry mutation funnels through this manager (and, for
//! replacement, the self-healing coordinator): assignment, spawn on
//! demand, heartbeats, deregistration, and the health sweep. The
//! executor never touches the registry directly.

use crate::config::EngineConfig;
use crate::core::subtask::SubtaskNode;
use crate::error::{AssignmentError, Error, Result};
use crate::events::{self, EngineEvent};
use crate::registry::{AgentId, AgentRecord, HealthState, HealthTransition, Registry};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Authorization check consulted before every assignment.
///
/// Supplied by the governance layer; the engine only asks, never decides.
pub trait Authorizer: Send + Sync {
    /// Whether the agent may be handed the node.
    fn can_assign(&self, agent: &AgentRecord, node: &SubtaskNode) -> bool;
}

/// Default authorizer that approves everything.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_assign(&self, _agent: &AgentRecord, _node: &SubtaskNode) -> bool {
        true
    }
}

/// Hook invoked when the manager creates a new agent record, so a worker
/// runtime can be brought up for it.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Bring up a worker runtime for the record.
    async fn spawn(&self, record: &AgentRecord);
}

/// Manages the agent pool: matching, spawning, health, replacement.
pub struct HierarchyManager {
    registry: Arc<RwLock<Registry>>,
    authorizer: Arc<dyn Authorizer>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    max_pool_size: usize,
    agent_max_concurrency: usize,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl HierarchyManager {
    /// Create a manager over a fresh registry.
    pub fn new(config: &EngineConfig, event_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self::with_registry(Registry::new(), config, event_tx)
    }

    /// Create a manager over an existing registry (restored from disk).
    pub fn with_registry(
        registry: Registry,
        config: &EngineConfig,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            authorizer: Arc::new(AllowAll),
            spawner: None,
            max_pool_size: config.max_pool_size,
            agent_max_concurrency: config.agent_max_concurrency,
            event_tx,
        }
    }

    /// Install an authorizer, builder-style.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Install a worker spawner, builder-style.
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Shared read access to the registry, for reporting.
    pub fn registry(&self) -> &Arc<RwLock<Registry>> {
        &self.registry
    }

    /// Assign the node to the best-matching agent.
    ///
    /// Candidates must match the node's layer, hold a superset of its
    /// capabilities, have spare concurrency, and pass authorization.
    /// Selection is least-load first, healthy before degraded, and the
    /// completion rate breaks ties. With no candidate and room in the
    /// pool, a new agent is spawned for the node.
    pub async fn assign(
        &self,
        node: &SubtaskNode,
    ) -> std::result::Result<AgentId, AssignmentError> {
        let spawned = {
            let mut registry = self.registry.write().await;

            let mut candidates: Vec<&AgentRecord> = registry
                .candidates(node)
                .into_iter()
                .filter(|agent| self.authorizer.can_assign(agent, node))
                .collect();

            candidates.sort_by(|a, b| {
                let degraded = |r: &AgentRecord| r.health == HealthState::Degraded;
                degraded(a)
                    .cmp(&degraded(b))
                    .then(a.load.cmp(&b.load))
                    .then(
                        b.completion_rate
                            .partial_cmp(&a.completion_rate)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            });

            if let Some(best) = candidates.first() {
                let id = best.id;
                if let Some(record) = registry.get_mut(&id) {
                    record.load += 1;
                }
                tracing::debug!(agent = %id.short(), node = %node.id.short(), "assigned");
                return Ok(id);
            }

            if registry.alive_count() >= self.max_pool_size {
                return Err(AssignmentError::NoCapacity {
                    max: self.max_pool_size,
                });
            }

            let mut record = AgentRecord::new(
                node.layer,
                node.required_capabilities.clone(),
                self.agent_max_concurrency,
            );
            if !self.authorizer.can_assign(&record, node) {
                return Err(AssignmentError::Unauthorized { agent: record.id });
            }
            record.load = 1;
            let snapshot = record.clone();
            let id = registry.insert(record);
            tracing::info!(agent = %id.short(), layer = %node.layer, "spawned agent for node");
            snapshot
        };

        if let Some(spawner) = &self.spawner {
            spawner.spawn(&spawned).await;
        }
        Ok(spawned.id)
    }

    /// Return an assignment, folding the outcome into the agent's
    /// completion statistic and freeing its slot.
    pub async fn release(&self, agent_id: &AgentId, success: bool) {
        let mut registry = self.registry.write().await;
        if let Some(record) = registry.get_mut(agent_id) {
            record.load = record.load.saturating_sub(1);
            record.record_outcome(success);
        }
    }

    /// Record a heartbeat from an agent.
    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        let mut registry = self.registry.write().await;
        let record = registry
            .get_mut(agent_id)
            .ok_or(Error::AgentNotFound { id: *agent_id })?;
        let was = record.health;
        record.record_heartbeat();
        if was == HealthState::Degraded {
            events::emit(
                &self.event_tx,
                EngineEvent::HealthChanged {
                    agent_id: *agent_id,
                    from: was,
                    to: HealthState::Healthy,
                },
            );
        }
        Ok(())
    }

    /// Remove an agent from the pool entirely.
    pub async fn deregister(&self, agent_id: &AgentId) -> Result<()> {
        self.registry
            .write()
            .await
            .remove(agent_id)
            .map(|_| ())
            .ok_or(Error::AgentNotFound { id: *agent_id })
    }

    /// Sweep heartbeat silence and publish the resulting transitions.
    pub async fn sweep_health(&self, config: &EngineConfig) -> Vec<HealthTransition> {
        let transitions = self
            .registry
            .write()
            .await
            .sweep_health(
                config.heartbeat_degraded_after(),
                config.heartbeat_unresponsive_after(),
            );

        for transition in &transitions {
            tracing::info!(
                agent = %transition.agent_id.short(),
                from = %transition.from,
                to = %transition.to,
                "health transition"
            );
            events::emit(
                &self.event_tx,
                EngineEvent::HealthChanged {
                    agent_id: transition.agent_id,
                    from: transition.from,
                    to: transition.to,
                },
            );
        }
        transitions
    }

    /// Replace a dead agent with a fresh one of the same layer and
    /// capabilities. The dead record is marked Replaced, never removed,
    /// so its history survives.
    pub async fn replace(
        &self,
        failed: &AgentId,
    ) -> std::result::Result<AgentId, AssignmentError> {
        let spawned = {
            let mut registry = self.registry.write().await;

            let (layer, capabilities) = match registry.get(failed) {
                Some(record) => (record.layer, record.capabilities.clone()),
                None => {
                    return Err(AssignmentError::Unauthorized { agent: *failed });
                }
            };

            registry.mark_replaced(failed);

            if registry.alive_count() >= self.max_pool_size {
                return Err(AssignmentError::NoCapacity {
                    max: self.max_pool_size,
                });
            }

            let record = AgentRecord::new(layer, capabilities, self.agent_max_concurrency);
            let snapshot = record.clone();
            registry.insert(record);
            tracing::info!(
                failed = %failed.short(),
                replacement = %snapshot.id.short(),
                "replaced agent"
            );
            snapshot
        };

        if let Some(spawner) = &self.spawner {
            spawner.spawn(&spawned).await;
        }
        Ok(spawned.id)
    }
}
