//! Loose latency and throughput thresholds.
//!
//! The latency figures in the configuration are SLO targets, not proven
//! bounds, so these assertions are deliberately generous: they catch
//! order-of-magnitude regressions without flaking on loaded CI hosts.

use std::time::{Duration, Instant};

use serde_json::json;

use foreman::brain::NodeBehavior;
use foreman::bus::{CorrelationId, Message, MessageType};
use foreman::core::subtask::{Capability, Layer, SubtaskNode};
use foreman::core::task::TaskId;
use foreman::executor::RunStatus;
use foreman::healing::{recovery_budget_of, HealingCoordinator};
use foreman::registry::{AgentId, HealthState};
use foreman::EngineConfig;

use crate::fixtures::{fast_config, parallel_proposal, EngineHarness};

/// Test: point-to-point delivery stays cheap
/// Given 200 messages to a single subscriber
/// When they are sent and drained back to back
/// Then the whole exchange finishes well under a second per hundred
#[tokio::test]
async fn test_bus_delivery_latency_loose() {
    let harness = EngineHarness::new(fast_config());
    let sender = AgentId::new();
    let receiver = AgentId::new();
    let sub = harness.bus.subscribe(receiver, Layer::Specialist, &[]).await;

    let correlation = CorrelationId::new();
    let started = Instant::now();
    for seq in 0..200 {
        harness
            .bus
            .send(Message::to_agent(
                MessageType::ContextShare,
                sender,
                receiver,
                correlation,
                json!({"seq": seq}),
            ))
            .await
            .unwrap();
    }
    for _ in 0..200 {
        sub.recv().await;
    }
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "delivery too slow: {:?}",
        started.elapsed()
    );

    harness.teardown().await;
}

/// Test: a wide DAG saturates the pool and finishes promptly
/// Given 20 independent nodes over 8 agents with 2 slots each
/// When the executor runs
/// Then everything completes in a couple of dispatch waves
#[tokio::test]
async fn test_wide_dag_completes_within_budget() {
    let config = EngineConfig {
        max_pool_size: 8,
        agent_max_concurrency: 2,
        node_timeout_secs: 10,
        run_wall_clock_secs: 30,
        heartbeat_interval_secs: 1,
        ..Default::default()
    };
    let harness = EngineHarness::new(config);

    let names: Vec<String> = (0..20).map(|i| format!("w{}", i)).collect();
    for name in &names {
        harness.brain.set_behavior(
            name,
            NodeBehavior::succeed(json!({"ok": true})).with_delay(Duration::from_millis(100)),
        );
    }
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let dag = harness.decompose(parallel_proposal(&name_refs)).await;

    let mut executor = harness.executor(dag).await;
    let started = Instant::now();
    let output = executor.execute().await.expect("run should complete");

    assert_eq!(executor.run().status, RunStatus::Completed);
    for name in &names {
        assert_eq!(output[name]["ok"], true);
    }
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "wide DAG too slow: {:?}",
        started.elapsed()
    );

    harness.teardown().await;
}

/// Test: replacement lands inside the configured budget
/// Given an unresponsive agent holding a node
/// When the coordinator recovers it directly
/// Then the replacement notice arrives within the recovery budget
#[tokio::test]
async fn test_recovery_latency_within_budget() {
    let harness = EngineHarness::new(fast_config());
    let node = SubtaskNode::new(TaskId::new(), "held", "d", Layer::Specialist)
        .with_capability(Capability::Research);
    let failed = harness.hierarchy.assign(&node).await.unwrap();
    {
        let mut registry = harness.hierarchy.registry().write().await;
        registry.get_mut(&failed).unwrap().health = HealthState::Unresponsive;
    }

    let listener = AgentId::new();
    let sub = harness
        .bus
        .subscribe(listener, Layer::Executive, &[MessageType::ReplacementNotice])
        .await;

    let coordinator = HealingCoordinator::new(
        harness.config.clone(),
        harness.bus.clone(),
        std::sync::Arc::clone(&harness.hierarchy),
        AgentId::new(),
    );

    let started = Instant::now();
    coordinator.recover(&failed).await;
    let notice = sub.recv().await;
    let elapsed = started.elapsed();

    assert_eq!(notice.message_type, MessageType::ReplacementNotice);
    assert!(
        elapsed <= recovery_budget_of(&harness.config),
        "recovery exceeded budget: {:?}",
        elapsed
    );

    harness.teardown().await;
}
