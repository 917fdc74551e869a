//! Typed inter-agent communication bus.
//!
//! The bus delivers addressed, typed messages between endpoints (agents
//! and executors). Each subscriber owns its own bounded queue, so many
//! concurrent senders never contend on a shared list. Delivery is
//! at-least-once; consumers deduplicate on (correlation id, type).
//!
//! Ordering: messages into one subscriber's queue keep their send order,
//! which gives per-correlation ordering for free. Nothing is guaranteed
//! across different correlation ids.
//!
//! Backpressure: a queue above the high-water mark sheds its
//! lowest-priority pending messages (heartbeats before results) instead
//! of blocking senders.
//!
//! Escalation: a help request that nobody answers within the configured
//! window is re-addressed one layer up, a bounded number of times, after
//! which the bus converts it into a failure notice for the executor.

use crate::core::subtask::{Layer, NodeId};
use crate::core::task::TaskId;
use crate::error::DeliveryError;
use crate::events::{self, EngineEvent};
use crate::registry::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation key tying a message to a node, task, or conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_node(id: NodeId) -> Self {
        Self(id.0)
    }

    pub fn from_task(id: TaskId) -> Self {
        Self(id.0)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message type. Open set in the protocol sense; closed enum here so
/// routing and shedding stay exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    AssignmentAck,
    AssignmentRejected,
    TaskResult,
    FailureNotice,
    Progress,
    HelpRequest,
    HelpResponse,
    ContextShare,
    ContextRequest,
    Escalation,
    EscalationAck,
    Heartbeat,
    HealthProbe,
    HealthReport,
    Cancellation,
    CancellationAck,
    StatusQuery,
    StatusReport,
    GateReview,
    GateVerdict,
    ReplacementNotice,
    LoadReport,
    Shutdown,
}

impl MessageType {
    /// Shedding priority; higher survives longer under backpressure.
    ///
    /// Heartbeats and other periodic chatter go first; assignments,
    /// results, and cancellations go last.
    pub fn priority(&self) -> u8 {
        match self {
            MessageType::Heartbeat
            | MessageType::Progress
            | MessageType::LoadReport
            | MessageType::HealthProbe
            | MessageType::HealthReport => 0,
            MessageType::ContextShare
            | MessageType::ContextRequest
            | MessageType::StatusQuery
            | MessageType::StatusReport => 1,
            MessageType::HelpRequest
            | MessageType::HelpResponse
            | MessageType::Escalation
            | MessageType::EscalationAck
            | MessageType::GateReview
            | MessageType::GateVerdict
            | MessageType::AssignmentAck
            | MessageType::AssignmentRejected
            | MessageType::ReplacementNotice => 2,
            MessageType::TaskAssignment
            | MessageType::TaskResult
            | MessageType::FailureNotice
            | MessageType::Cancellation
            | MessageType::CancellationAck
            | MessageType::Shutdown => 3,
        }
    }
}

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum Recipient {
    /// One specific endpoint.
    Agent { id: AgentId },
    /// Every subscriber at a hierarchy layer.
    Layer { layer: Layer },
    /// Every subscriber.
    Broadcast,
}

/// An addressed unit on the bus. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// The message type.
    pub message_type: MessageType,
    /// Sending endpoint.
    pub sender: AgentId,
    /// Addressed recipient or scope.
    pub recipient: Recipient,
    /// Ties the message to a node, task, or conversation.
    pub correlation: CorrelationId,
    /// The message this one answers, for request/response resolution.
    pub in_reply_to: Option<MessageId>,
    /// Business payload; the bus never interprets it.
    pub payload: serde_json::Value,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Create a message addressed to a single endpoint.
    pub fn to_agent(
        message_type: MessageType,
        sender: AgentId,
        recipient: AgentId,
        correlation: CorrelationId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type,
            sender,
            recipient: Recipient::Agent { id: recipient },
            correlation,
            in_reply_to: None,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Create a message addressed to a whole layer.
    pub fn to_layer(
        message_type: MessageType,
        sender: AgentId,
        layer: Layer,
        correlation: CorrelationId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type,
            sender,
            recipient: Recipient::Layer { layer },
            correlation,
            in_reply_to: None,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Create a broadcast message.
    pub fn broadcast(
        message_type: MessageType,
        sender: AgentId,
        correlation: CorrelationId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type,
            sender,
            recipient: Recipient::Broadcast,
            correlation,
            in_reply_to: None,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Create a reply to this message, addressed back at its sender and
    /// carrying the same correlation.
    pub fn reply(&self, message_type: MessageType, sender: AgentId, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::new(),
            message_type,
            sender,
            recipient: Recipient::Agent { id: self.sender },
            correlation: self.correlation,
            in_reply_to: Some(self.id),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Dedup key for idempotent consumers.
    pub fn dedup_key(&self) -> (CorrelationId, MessageType) {
        (self.correlation, self.message_type)
    }
}

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Queue depth above which shedding kicks in.
    pub queue_high_water: usize,
    /// Window within which a help request must be answered.
    pub escalation_window: Duration,
    /// Maximum escalation hops before a failure notice.
    pub max_escalation_hops: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_high_water: 256,
            escalation_window: Duration::from_secs(30),
            max_escalation_hops: 2,
        }
    }
}

struct SubscriberState {
    layer: Layer,
    /// Empty set means "all types".
    types: HashSet<MessageType>,
    queue: Arc<Mutex<VecDeque<Message>>>,
    notify: Arc<Notify>,
    /// Set once the queue first crosses the high-water mark.
    degraded: bool,
}

struct EscalationState {
    message: Message,
    current_layer: Layer,
    hops: u32,
    deadline: Instant,
}

struct BusInner {
    config: BusConfig,
    subscribers: RwLock<HashMap<AgentId, SubscriberState>>,
    /// In-flight request/response exchanges keyed by request id.
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Message>>>,
    /// Help requests awaiting a response, keyed by correlation.
    escalations: Mutex<HashMap<CorrelationId, EscalationState>>,
    /// Endpoint that receives failure notices when escalation runs dry.
    failure_sink: RwLock<Option<AgentId>>,
    event_tx: mpsc::Sender<EngineEvent>,
    shutdown: CancellationToken,
}

/// Receiving side of a subscription.
pub struct Subscription {
    agent_id: AgentId,
    queue: Arc<Mutex<VecDeque<Message>>>,
    notify: Arc<Notify>,
}

impl Subscription {
    /// The endpoint this subscription belongs to.
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Receive the next message, waiting if the queue is empty.
    pub async fn recv(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.queue.lock().await.pop_front() {
                return message;
            }
            notified.await;
        }
    }

    /// Receive without waiting.
    pub async fn try_recv(&self) -> Option<Message> {
        self.queue.lock().await.pop_front()
    }

    /// Number of queued messages.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Check if the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

/// The communication bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus with the given configuration and event sink.
    pub fn new(config: BusConfig, event_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                subscribers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                escalations: Mutex::new(HashMap::new()),
                failure_sink: RwLock::new(None),
                event_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register an endpoint. An empty type list subscribes to everything.
    pub async fn subscribe(
        &self,
        agent_id: AgentId,
        layer: Layer,
        types: &[MessageType],
    ) -> Subscription {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        let state = SubscriberState {
            layer,
            types: types.iter().copied().collect(),
            queue: Arc::clone(&queue),
            notify: Arc::clone(&notify),
            degraded: false,
        };
        self.inner.subscribers.write().await.insert(agent_id, state);

        Subscription {
            agent_id,
            queue,
            notify,
        }
    }

    /// Remove an endpoint. Its queued messages are dropped.
    pub async fn unsubscribe(&self, agent_id: &AgentId) {
        self.inner.subscribers.write().await.remove(agent_id);
    }

    /// Declare the endpoint that receives failure notices produced by
    /// exhausted escalations.
    pub async fn set_failure_sink(&self, agent_id: AgentId) {
        *self.inner.failure_sink.write().await = Some(agent_id);
    }

    /// Number of registered endpoints.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().await.len()
    }

    /// Send a message to its addressed recipients.
    ///
    /// Replies to an in-flight `request` are routed to the waiting caller
    /// instead of a queue. Help requests start an escalation timer.
    ///
    /// # Errors
    /// `DeliveryError::NoSubscriber` when the addressed endpoint or layer
    /// has no registered subscriber; `DeliveryError::Shed` when every
    /// addressed queue refused the message under backpressure.
    pub async fn send(&self, message: Message) -> Result<(), DeliveryError> {
        tracing::trace!(
            id = %message.id,
            ty = ?message.message_type,
            corr = %message.correlation,
            "bus send"
        );

        // Route replies to a waiting request() caller first.
        if let Some(request_id) = message.in_reply_to {
            if let Some(waiter) = self.inner.pending.lock().await.remove(&request_id) {
                self.resolve_escalation(&message).await;
                let _ = waiter.send(message);
                return Ok(());
            }
        }

        self.resolve_escalation(&message).await;

        if message.message_type == MessageType::HelpRequest {
            self.track_escalation(&message).await;
        }

        self.deliver(message).await
    }

    /// Send a message and wait for a reply within `timeout`.
    pub async fn request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, DeliveryError> {
        let request_id = message.id;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(request_id, tx);

        if let Err(err) = self.send(message).await {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(DeliveryError::Timeout(timeout))
            }
        }
    }

    /// Process expired help requests: escalate one layer up or, with all
    /// hops spent, convert to a failure notice for the failure sink.
    ///
    /// Returns the number of entries acted on. Normally driven by the
    /// watchdog task; exposed for tests.
    pub async fn tick_escalations(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(CorrelationId, Message, Layer, u32)> = {
            let mut escalations = self.inner.escalations.lock().await;
            let keys: Vec<CorrelationId> = escalations
                .iter()
                .filter(|(_, s)| s.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| {
                    escalations
                        .remove(&k)
                        .map(|s| (k, s.message, s.current_layer, s.hops))
                })
                .collect()
        };

        let mut acted = 0;
        for (correlation, original, current_layer, hops) in expired {
            acted += 1;
            let next = match current_layer.escalation_target() {
                Some(next) if hops < self.inner.config.max_escalation_hops => next,
                _ => {
                    tracing::warn!(corr = %correlation, hops, "help request exhausted escalation");
                    self.send_failure_notice(&original).await;
                    continue;
                }
            };

            tracing::debug!(corr = %correlation, layer = %next, hop = hops + 1, "escalating help request");

            let mut escalated = original.clone();
            escalated.id = MessageId::new();
            escalated.message_type = MessageType::Escalation;
            escalated.recipient = Recipient::Layer { layer: next };
            escalated.sent_at = Utc::now();

            self.inner.escalations.lock().await.insert(
                correlation,
                EscalationState {
                    message: escalated.clone(),
                    current_layer: next,
                    hops: hops + 1,
                    deadline: now + self.inner.config.escalation_window,
                },
            );

            // Best effort; a shed escalation retries on the next tick.
            let _ = self.deliver(escalated).await;
        }

        acted
    }

    /// Spawn the escalation watchdog. Runs until `shutdown` is triggered.
    pub fn start_watchdog(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = bus.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        bus.tick_escalations().await;
                    }
                }
            }
        })
    }

    /// Stop the watchdog and any other background work.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Help requests currently awaiting a response. For tests.
    pub async fn pending_escalations(&self) -> usize {
        self.inner.escalations.lock().await.len()
    }

    async fn track_escalation(&self, message: &Message) {
        let current_layer = match message.recipient {
            Recipient::Layer { layer } => layer,
            // A direct help request escalates from the recipient's layer.
            Recipient::Agent { id } => {
                let subscribers = self.inner.subscribers.read().await;
                match subscribers.get(&id) {
                    Some(state) => state.layer,
                    None => return,
                }
            }
            Recipient::Broadcast => return,
        };

        self.inner.escalations.lock().await.insert(
            message.correlation,
            EscalationState {
                message: message.clone(),
                current_layer,
                hops: 0,
                deadline: Instant::now() + self.inner.config.escalation_window,
            },
        );
    }

    /// An answer with the same correlation closes the escalation.
    async fn resolve_escalation(&self, message: &Message) {
        if matches!(
            message.message_type,
            MessageType::HelpResponse | MessageType::EscalationAck
        ) {
            self.inner
                .escalations
                .lock()
                .await
                .remove(&message.correlation);
        }
    }

    async fn send_failure_notice(&self, original: &Message) {
        let sink = *self.inner.failure_sink.read().await;
        let recipient = match sink {
            Some(id) => id,
            // Nobody to tell; fall back to the requester.
            None => original.sender,
        };

        let notice = Message {
            id: MessageId::new(),
            message_type: MessageType::FailureNotice,
            sender: original.sender,
            recipient: Recipient::Agent { id: recipient },
            correlation: original.correlation,
            in_reply_to: None,
            payload: serde_json::json!({
                "reason": "help request unanswered after escalation",
                "original_payload": original.payload,
            }),
            sent_at: Utc::now(),
        };
        let _ = self.deliver(notice).await;
    }

    async fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        let targets: Vec<AgentId> = {
            let subscribers = self.inner.subscribers.read().await;
            match message.recipient {
                Recipient::Agent { id } => {
                    if subscribers.contains_key(&id) {
                        vec![id]
                    } else {
                        return Err(DeliveryError::NoSubscriber(id.to_string()));
                    }
                }
                Recipient::Layer { layer } => {
                    let ids: Vec<AgentId> = subscribers
                        .iter()
                        .filter(|(_, s)| s.layer == layer)
                        .map(|(id, _)| *id)
                        .collect();
                    if ids.is_empty() {
                        return Err(DeliveryError::NoSubscriber(layer.to_string()));
                    }
                    ids
                }
                Recipient::Broadcast => subscribers.keys().copied().collect(),
            }
        };

        let mut delivered = 0;
        for target in targets {
            if self.enqueue(&target, message.clone()).await {
                delivered += 1;
            }
        }

        if delivered == 0 {
            return Err(DeliveryError::Shed);
        }
        Ok(())
    }

    /// Push one message into one subscriber queue, shedding under
    /// backpressure. Returns whether the message was queued.
    async fn enqueue(&self, target: &AgentId, message: Message) -> bool {
        let mut subscribers = self.inner.subscribers.write().await;
        let state = match subscribers.get_mut(target) {
            Some(state) => state,
            None => return false,
        };

        // Type filter; an empty set means everything.
        if !state.types.is_empty() && !state.types.contains(&message.message_type) {
            return false;
        }

        let mut queue = state.queue.lock().await;

        if queue.len() >= self.inner.config.queue_high_water {
            if !state.degraded {
                state.degraded = true;
                events::emit(
                    &self.inner.event_tx,
                    EngineEvent::DeliveryDegraded {
                        subscriber: *target,
                        queued: queue.len(),
                    },
                );
            }

            // Shed the oldest strictly-lower-priority queued message.
            let victim = queue
                .iter()
                .enumerate()
                .filter(|(_, m)| m.message_type.priority() < message.message_type.priority())
                .min_by_key(|(_, m)| m.message_type.priority())
                .map(|(i, _)| i);

            match victim {
                Some(index) => {
                    if let Some(shed) = queue.remove(index) {
                        tracing::debug!(
                            subscriber = %target,
                            ty = ?shed.message_type,
                            "shedding queued message"
                        );
                        events::emit(
                            &self.inner.event_tx,
                            EngineEvent::MessageShed {
                                subscriber: *target,
                                message_type: shed.message_type,
                            },
                        );
                    }
                }
                None => {
                    // Nothing cheaper queued; the incoming message loses.
                    events::emit(
                        &self.inner.event_tx,
                        EngineEvent::MessageShed {
                            subscriber: *target,
                            message_type: message.message_type,
                        },
                    );
                    return false;
                }
            }
        } else if state.degraded && queue.len() < self.inner.config.queue_high_water / 2 {
            state.degraded = false;
        }

        queue.push_back(message);
        drop(queue);
        state.notify.notify_one();
        true
    }
}
