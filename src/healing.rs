//! Self-healing coordinator.
//!
//! Owns the health loop: it receives heartbeats on its bus endpoint,
//! sweeps the registry for silence, and reacts when an agent goes
//! unresponsive by obtaining a same-shape replacement from the hierarchy
//! manager and notifying executors so only the affected nodes are
//! re-addressed. The whole replacement is bounded by the recovery
//! budget; past it, the node is handed to the executor's retry policy
//! instead of being retried here forever.

use crate::bus::{Bus, CorrelationId, Message, MessageType};
use crate::config::EngineConfig;
use crate::core::subtask::Layer;
use crate::error::HealingError;
use crate::executor::ReplacementNotice;
use crate::hierarchy::HierarchyManager;
use crate::registry::{AgentId, HealthState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Watches agent health and coordinates replacement.
pub struct HealingCoordinator {
    config: EngineConfig,
    bus: Bus,
    hierarchy: Arc<HierarchyManager>,
    /// Bus endpoint heartbeats are addressed to.
    endpoint: AgentId,
    cancel: CancellationToken,
}

impl HealingCoordinator {
    /// Create a coordinator listening on the given endpoint id.
    ///
    /// The endpoint id is chosen by the caller so worker runtimes can be
    /// configured with it before the coordinator starts.
    pub fn new(
        config: EngineConfig,
        bus: Bus,
        hierarchy: Arc<HierarchyManager>,
        endpoint: AgentId,
    ) -> Self {
        Self {
            config,
            bus,
            hierarchy,
            endpoint,
            cancel: CancellationToken::new(),
        }
    }

    /// The endpoint heartbeats should be addressed to.
    pub fn endpoint(&self) -> AgentId {
        self.endpoint
    }

    /// Token that stops the health loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe and run the health loop until cancelled.
    pub async fn start(self) -> tokio::task::JoinHandle<()> {
        let subscription = self
            .bus
            .subscribe(self.endpoint, Layer::Executive, &[MessageType::Heartbeat])
            .await;
        let sweep_interval = self.config.heartbeat_interval();

        tokio::spawn(async move {
            tracing::debug!(endpoint = %self.endpoint.short(), "healing coordinator started");
            // A ticking interval rather than a re-armed sleep: a busy
            // heartbeat stream must not starve the sweep.
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    message = subscription.recv() => {
                        if message.message_type == MessageType::Heartbeat {
                            let _ = self.hierarchy.heartbeat(&message.sender).await;
                        }
                    }
                    _ = sweep.tick() => {
                        self.sweep_and_recover().await;
                    }
                }
            }
        })
    }

    /// One health sweep plus recovery for every newly dead agent.
    ///
    /// Exposed for tests; the loop calls this on every tick.
    pub async fn sweep_and_recover(&self) {
        let transitions = self.hierarchy.sweep_health(&self.config).await;
        for transition in transitions {
            match transition.to {
                HealthState::Unresponsive => self.recover(&transition.agent_id).await,
                HealthState::Degraded => self.probe(&transition.agent_id).await,
                _ => {}
            }
        }
    }

    /// Last-chance probe of a freshly Degraded agent.
    ///
    /// An answered probe counts as a heartbeat, restoring the agent
    /// before silence carries it to Unresponsive. An unanswered probe
    /// changes nothing; the next sweep decides.
    async fn probe(&self, agent_id: &AgentId) {
        let probe = Message::to_agent(
            MessageType::HealthProbe,
            self.endpoint,
            *agent_id,
            CorrelationId::new(),
            serde_json::json!({}),
        );
        match self.bus.request(probe, self.config.request_timeout()).await {
            Ok(report) if report.message_type == MessageType::HealthReport => {
                tracing::debug!(agent = %agent_id.short(), "probe answered, agent restored");
                let _ = self.hierarchy.heartbeat(agent_id).await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(agent = %agent_id.short(), %err, "health probe unanswered");
            }
        }
    }

    /// Replace a dead agent within the recovery budget and notify
    /// executors so in-flight nodes are re-addressed.
    pub async fn recover(&self, failed: &AgentId) {
        let budget = self.config.recovery_budget();

        let (replacement, within_budget) =
            match tokio::time::timeout(budget, self.hierarchy.replace(failed)).await {
                Ok(Ok(replacement)) => (Some(replacement), true),
                Ok(Err(err)) => {
                    tracing::error!(failed = %failed.short(), %err, "replacement unavailable");
                    (None, true)
                }
                Err(_) => {
                    tracing::error!(
                        failed = %failed.short(),
                        "{}",
                        HealingError::RecoveryBudgetExceeded(budget)
                    );
                    (None, false)
                }
            };

        let notice = ReplacementNotice {
            failed: *failed,
            replacement,
            within_budget,
        };
        let payload = match serde_json::to_value(&notice) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%err, "unserializable replacement notice");
                return;
            }
        };

        // Every executor subscribes at the executive layer; the ones not
        // holding work for the dead agent ignore the notice.
        let message = Message::to_layer(
            MessageType::ReplacementNotice,
            self.endpoint,
            Layer::Executive,
            CorrelationId::new(),
            payload,
        );
        if let Err(err) = self.bus.send(message).await {
            tracing::debug!(%err, "no executor to notify of replacement");
        }
    }
}

/// Convenience: how long recovery may take, for assertions in tests.
pub fn recovery_budget_of(config: &EngineConfig) -> Duration {
    config.recovery_budget()
}
