//! Self-healing integration tests.
//!
//! These tests kill a worker mid-node and verify the coordinator
//! detects the silence, obtains a same-shape replacement, and
//! re-addresses only the affected node, all within the recovery budget.

use std::time::{Duration, Instant};

use serde_json::json;

use foreman::brain::{linear_proposal, NodeBehavior};
use foreman::events::EngineEvent;
use foreman::executor::RunStatus;
use foreman::healing::recovery_budget_of;
use foreman::registry::HealthState;
use foreman::EngineConfig;

use crate::fixtures::EngineHarness;

fn recovery_config() -> EngineConfig {
    EngineConfig {
        heartbeat_interval_secs: 1,
        heartbeat_degraded_after_secs: 1,
        heartbeat_unresponsive_after_secs: 2,
        // Keep the last-chance probe of the dead agent short so the
        // sweep reaches the Unresponsive verdict promptly.
        request_timeout_ms: 500,
        node_timeout_secs: 20,
        run_wall_clock_secs: 30,
        node_retries: 3,
        ..Default::default()
    }
}

/// Test: agent killed mid-node is replaced and the node completes
/// Given a worker executing a node that hangs on its first attempt
/// When the worker is killed and stops heartbeating
/// Then the coordinator replaces it within budget, only the affected
/// node re-runs, and the run completes with a single recorded output
#[tokio::test]
async fn test_killed_agent_replaced_and_node_completes() {
    let mut harness = EngineHarness::new(recovery_config());
    // First execution hangs forever (it dies with the killed worker);
    // the replacement's execution succeeds.
    harness
        .brain
        .set_behavior("victim", NodeBehavior::hang_times(1, json!({"recovered": true})));
    harness
        .brain
        .set_behavior("after", NodeBehavior::succeed(json!({"follow_up": 1})));

    let (healing_cancel, healing_handle) = harness.start_healing().await;

    let dag = harness.decompose(linear_proposal(&["victim", "after"])).await;
    let victim_node = dag
        .all_nodes()
        .iter()
        .find(|n| n.name == "victim")
        .map(|n| n.id)
        .unwrap();

    let executor = harness.executor(dag).await;
    let handle = tokio::spawn(async move {
        let mut executor = executor;
        let result = executor.execute().await;
        (executor, result)
    });

    // Let the victim node reach its worker, then kill that worker.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let victim_agent = {
        let registry = harness.hierarchy.registry().read().await;
        let victim = registry
            .iter()
            .find(|record| record.load > 0)
            .map(|record| record.id)
            .expect("one agent should hold the node");
        victim
    };
    assert!(harness.host.kill(&victim_agent).await);
    let killed_at = Instant::now();

    let (executor, result) = handle.await.unwrap();
    let output = result.expect("run should complete via replacement");
    assert!(killed_at.elapsed() <= recovery_budget_of(&harness.config));

    assert_eq!(executor.run().status, RunStatus::Completed);
    assert_eq!(output["victim"]["recovered"], true);
    assert_eq!(output["after"]["follow_up"], 1);

    // One orphaned hanging attempt plus the replacement's success; the
    // downstream node ran exactly once.
    assert_eq!(harness.brain.execution_count("victim"), 2);
    assert_eq!(harness.brain.execution_count("after"), 1);

    let recoveries = &executor.run().recovery_log;
    assert_eq!(recoveries.len(), 1);
    assert_eq!(recoveries[0].failed, victim_agent);
    assert_eq!(recoveries[0].node, victim_node);
    assert!(recoveries[0].within_budget);
    let replacement = recoveries[0].replacement.expect("replacement obtained");
    assert_ne!(replacement, victim_agent);

    {
        let registry = harness.hierarchy.registry().read().await;
        assert_eq!(
            registry.get(&victim_agent).unwrap().health,
            HealthState::Replaced
        );
        assert_eq!(
            registry.get(&replacement).unwrap().health,
            HealthState::Healthy
        );
    }

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::RecoveryTriggered { failed, .. } if *failed == victim_agent
    )));

    healing_cancel.cancel();
    let _ = healing_handle.await;
    harness.teardown().await;
}

/// Test: heartbeats keep live agents off the recovery path
/// Given aggressive silence thresholds and a run long enough to span
/// several heartbeat intervals
/// When workers heartbeat normally
/// Then no recovery triggers and every agent stays healthy
#[tokio::test]
async fn test_heartbeats_prevent_spurious_recovery() {
    let config = EngineConfig {
        heartbeat_interval_secs: 1,
        heartbeat_degraded_after_secs: 2,
        heartbeat_unresponsive_after_secs: 4,
        node_timeout_secs: 10,
        run_wall_clock_secs: 20,
        ..Default::default()
    };
    let mut harness = EngineHarness::new(config);
    harness.brain.set_behavior(
        "first",
        NodeBehavior::succeed(json!({"v": 1})).with_delay(Duration::from_millis(1200)),
    );
    harness.brain.set_behavior(
        "second",
        NodeBehavior::succeed(json!({"v": 2})).with_delay(Duration::from_millis(1200)),
    );

    let (healing_cancel, healing_handle) = harness.start_healing().await;

    let dag = harness.decompose(linear_proposal(&["first", "second"])).await;
    let mut executor = harness.executor(dag).await;
    let output = executor.execute().await.expect("run should complete");

    assert_eq!(output["second"]["v"], 2);
    assert!(executor.run().recovery_log.is_empty());

    let events = harness.drain_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::RecoveryTriggered { .. })));
    {
        let registry = harness.hierarchy.registry().read().await;
        for record in registry.iter() {
            assert_eq!(record.health, HealthState::Healthy);
        }
    }

    healing_cancel.cancel();
    let _ = healing_handle.await;
    harness.teardown().await;
}
