//! Worker runtime for logical agents.
//!
//! An `AgentWorker` pumps one agent's bus subscription: it executes task
//! assignments through the reasoning capability, replies with results or
//! failure notices, and emits jittered heartbeats to the health endpoint
//! while alive. The `WorkerHost` brings workers up on demand when the
//! hierarchy manager spawns new agent records, and can kill one to
//! simulate or handle a dead worker.

use crate::brain::{Reasoning, WorkOrder};
use crate::bus::{Bus, Message, MessageType, Subscription};
use crate::core::subtask::Layer;
use crate::hierarchy::WorkerSpawner;
use crate::registry::{AgentId, AgentRecord};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One running worker pump.
pub struct AgentWorker {
    agent_id: AgentId,
    brain: Arc<dyn Reasoning>,
    bus: Bus,
    health_endpoint: AgentId,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

impl AgentWorker {
    /// Create a worker for an agent id.
    pub fn new(
        agent_id: AgentId,
        brain: Arc<dyn Reasoning>,
        bus: Bus,
        health_endpoint: AgentId,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            agent_id,
            brain,
            bus,
            health_endpoint,
            heartbeat_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops this worker when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe on the bus and run the pump until cancelled.
    ///
    /// The subscription is registered before this returns, so an
    /// assignment sent right after spawning cannot miss the worker. Each
    /// assignment executes on its own task so a slow node does not stall
    /// heartbeats or later assignments.
    pub async fn spawn(self, layer: Layer) -> tokio::task::JoinHandle<()> {
        let subscription = self
            .bus
            .subscribe(
                self.agent_id,
                layer,
                &[
                    MessageType::TaskAssignment,
                    MessageType::Cancellation,
                    MessageType::HealthProbe,
                    MessageType::HelpRequest,
                    MessageType::Escalation,
                    MessageType::ContextShare,
                ],
            )
            .await;
        tokio::spawn(async move { self.pump(subscription).await })
    }

    async fn pump(self, subscription: Subscription) {
        tracing::debug!(agent = %self.agent_id.short(), "worker started");
        loop {
            // Jitter spreads heartbeats so a large pool doesn't thunder.
            let jitter = {
                let mut rng = rand::rng();
                rng.random_range(Duration::ZERO..self.heartbeat_interval / 4)
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(agent = %self.agent_id.short(), "worker stopped");
                    break;
                }
                _ = tokio::time::sleep(self.heartbeat_interval + jitter) => {
                    self.send_heartbeat().await;
                }
                message = subscription.recv() => {
                    self.handle(message).await;
                }
            }
        }
    }

    async fn send_heartbeat(&self) {
        let heartbeat = Message::to_agent(
            MessageType::Heartbeat,
            self.agent_id,
            self.health_endpoint,
            crate::bus::CorrelationId::new(),
            serde_json::json!({}),
        );
        // Heartbeats are the first thing shed under pressure; losing one
        // is tolerated by the health thresholds.
        let _ = self.bus.send(heartbeat).await;
    }

    async fn handle(&self, message: Message) {
        match message.message_type {
            MessageType::TaskAssignment => {
                let brain = Arc::clone(&self.brain);
                let bus = self.bus.clone();
                let agent_id = self.agent_id;
                tokio::spawn(async move {
                    Self::execute_assignment(brain, bus, agent_id, message).await;
                });
            }
            MessageType::Cancellation => {
                tracing::debug!(agent = %self.agent_id.short(), corr = %message.correlation, "cancellation received");
            }
            MessageType::HealthProbe => {
                let report = message.reply(
                    MessageType::HealthReport,
                    self.agent_id,
                    serde_json::json!({"alive": true}),
                );
                let _ = self.bus.send(report).await;
            }
            other => {
                tracing::trace!(agent = %self.agent_id.short(), ty = ?other, "ignoring message");
            }
        }
    }

    async fn execute_assignment(
        brain: Arc<dyn Reasoning>,
        bus: Bus,
        agent_id: AgentId,
        message: Message,
    ) {
        let order: WorkOrder = match serde_json::from_value(message.payload.clone()) {
            Ok(order) => order,
            Err(err) => {
                let reply = message.reply(
                    MessageType::FailureNotice,
                    agent_id,
                    serde_json::json!({"error": format!("malformed assignment: {}", err)}),
                );
                let _ = bus.send(reply).await;
                return;
            }
        };

        tracing::debug!(agent = %agent_id.short(), node = %order.name, "executing");
        match brain.execute(&order).await {
            Ok(output) => {
                let reply = message.reply(MessageType::TaskResult, agent_id, output);
                let _ = bus.send(reply).await;
            }
            Err(err) => {
                let reply = message.reply(
                    MessageType::FailureNotice,
                    agent_id,
                    serde_json::json!({"error": err.to_string()}),
                );
                let _ = bus.send(reply).await;
            }
        }
    }
}

/// Brings up `AgentWorker`s for records the hierarchy manager creates,
/// and remembers their kill switches.
pub struct WorkerHost {
    brain: Arc<dyn Reasoning>,
    bus: Bus,
    health_endpoint: AgentId,
    heartbeat_interval: Duration,
    running: Mutex<HashMap<AgentId, CancellationToken>>,
}

impl WorkerHost {
    /// Create a host wiring new workers to the given brain and bus.
    pub fn new(
        brain: Arc<dyn Reasoning>,
        bus: Bus,
        health_endpoint: AgentId,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            brain,
            bus,
            health_endpoint,
            heartbeat_interval,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Stop the worker for an agent id. The agent immediately stops
    /// heartbeating and processing; in-flight brain calls are orphaned.
    pub async fn kill(&self, agent_id: &AgentId) -> bool {
        if let Some(token) = self.running.lock().await.remove(agent_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Number of live workers.
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Stop every worker.
    pub async fn kill_all(&self) {
        for (_, token) in self.running.lock().await.drain() {
            token.cancel();
        }
    }
}

#[async_trait]
impl WorkerSpawner for WorkerHost {
    async fn spawn(&self, record: &AgentRecord) {
        let worker = AgentWorker::new(
            record.id,
            Arc::clone(&self.brain),
            self.bus.clone(),
            self.health_endpoint,
            self.heartbeat_interval,
        );
        let token = worker.cancel_token();
        self.running.lock().await.insert(record.id, token);
        worker.spawn(record.layer).await;
    }
}
