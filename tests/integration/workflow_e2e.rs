//! End-to-end workflow integration tests.
//!
//! These tests drive the executor over decomposed DAGs with the full
//! component stack wired up: scripted brain, worker host, hierarchy
//! manager, and bus.

use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use foreman::brain::{linear_proposal, NodeBehavior};
use foreman::core::gate::{GateCriteria, QualityGate};
use foreman::core::subtask::Layer;
use foreman::error::WorkflowError;
use foreman::executor::RunStatus;
use foreman::store::StateStore;

use crate::fixtures::{completion_order, fast_config, parallel_proposal, EngineHarness};

/// Test: linear chain with a flaky middle node
/// Given tasks A -> B -> C where B fails twice then succeeds
/// When the executor runs the DAG
/// Then the run completes, B consumed three attempts, and completion
/// order respects the chain
#[tokio::test]
async fn test_linear_chain_flaky_node_recovers() {
    let mut harness = EngineHarness::new(fast_config());
    harness
        .brain
        .set_behavior("a", NodeBehavior::succeed(json!({"sources": 2})));
    harness
        .brain
        .set_behavior("b", NodeBehavior::fail_times(2, json!({"analysis": "ok"})));
    harness
        .brain
        .set_behavior("c", NodeBehavior::succeed(json!({"summary": "done"})));

    let dag = harness.decompose(linear_proposal(&["a", "b", "c"])).await;
    let ids: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            dag.all_nodes()
                .iter()
                .find(|n| n.name == *name)
                .map(|n| n.id)
                .unwrap()
        })
        .collect();

    let mut executor = harness.executor(dag).await;
    let output = executor.execute().await.expect("run should complete");

    assert_eq!(executor.run().status, RunStatus::Completed);
    assert_eq!(output["a"]["sources"], 2);
    assert_eq!(output["b"]["analysis"], "ok");
    assert_eq!(output["c"]["summary"], "done");

    assert_eq!(harness.brain.execution_count("a"), 1);
    assert_eq!(harness.brain.execution_count("b"), 3);
    assert_eq!(harness.brain.execution_count("c"), 1);

    let events = harness.drain_events();
    let order = completion_order(&events);
    let pos = |id| order.iter().position(|x| *x == id).unwrap();
    assert!(pos(ids[0]) < pos(ids[1]));
    assert!(pos(ids[1]) < pos(ids[2]));

    harness.teardown().await;
}

/// Test: failing gate blocks downstream
/// Given A -> B with a gate on A whose criteria the output never meets
/// When the executor runs
/// Then B never executes and the run surfaces a partial failure listing
/// both nodes as not completed
#[tokio::test]
async fn test_failing_gate_blocks_downstream() {
    let mut harness = EngineHarness::new(fast_config());
    harness
        .brain
        .set_behavior("a", NodeBehavior::succeed(json!({"other": 1})));
    harness
        .brain
        .set_behavior("b", NodeBehavior::succeed(json!({"never": "runs"})));

    let mut dag = harness.decompose(linear_proposal(&["a", "b"])).await;
    let gated = dag
        .all_nodes()
        .iter()
        .find(|n| n.name == "a")
        .map(|n| n.id)
        .unwrap();
    dag.attach_gate(QualityGate::new(
        vec![gated],
        GateCriteria::RequiredField {
            field: "report".to_string(),
        },
        Layer::Management,
    ));

    let mut executor = harness.executor(dag).await;
    let result = executor.execute().await;

    match result {
        Err(WorkflowError::PartialFailure { completed, failed }) => {
            assert!(completed.is_empty());
            assert_eq!(failed.len(), 2);
        }
        other => panic!("expected PartialFailure, got {:?}", other),
    }
    // The gated node burned its retries; the downstream node never ran.
    assert_eq!(harness.brain.execution_count("a"), 3);
    assert_eq!(harness.brain.execution_count("b"), 0);

    harness.teardown().await;
}

/// Test: cancellation mid-run discards in-flight work
/// Given three slow independent nodes in flight
/// When the run is cancelled
/// Then the run ends Cancelled promptly and late results are discarded
/// without error
#[tokio::test]
async fn test_cancellation_discards_in_flight_nodes() {
    let mut harness = EngineHarness::new(fast_config());
    for name in ["p1", "p2", "p3"] {
        harness.brain.set_behavior(
            name,
            NodeBehavior::succeed(json!({})).with_delay(Duration::from_millis(600)),
        );
    }

    let dag = harness.decompose(parallel_proposal(&["p1", "p2", "p3"])).await;
    let mut executor = harness.executor(dag).await;
    let cancel = executor.cancel_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let result = executor.execute().await;
    assert!(matches!(result, Err(WorkflowError::Cancelled)));
    assert_eq!(executor.run().status, RunStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));

    // All three were in flight once; their late results land after the
    // run unsubscribed and must not disturb anything.
    assert_eq!(harness.brain.total_executions(), 3);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(executor.run().status, RunStatus::Cancelled);
    assert_eq!(executor.run().result, Some(json!({})));

    harness.teardown().await;
}

/// Test: terminal state survives restart
/// Given a completed run persisted to the state store
/// When the snapshots are loaded back
/// Then the run status, node statuses, and registry history match
#[tokio::test]
async fn test_run_state_survives_restart() {
    let mut harness = EngineHarness::new(fast_config());
    harness
        .brain
        .set_behavior("a", NodeBehavior::succeed(json!({"v": 1})));
    harness
        .brain
        .set_behavior("b", NodeBehavior::succeed(json!({"v": 2})));

    let dag = harness.decompose(linear_proposal(&["a", "b"])).await;
    let task_id = dag.task_id();
    let mut executor = harness.executor(dag).await;
    executor.execute().await.expect("run should complete");

    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).unwrap();
    store.save_run(executor.run()).unwrap();
    store.save_dag(&executor.dag().snapshot()).unwrap();
    store
        .save_registry(&harness.hierarchy.registry().read().await.snapshot())
        .unwrap();

    let run = store.load_run(&executor.run().id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.node_status.len(), 2);

    let snapshot = store.load_dag(&task_id).unwrap().unwrap();
    assert_eq!(snapshot.nodes.len(), 2);
    assert!(snapshot.nodes.iter().all(|n| n.output.is_some()));

    let registry = store.load_registry().unwrap().unwrap();
    assert!(!registry.agents.is_empty());

    harness.teardown().await;
}

/// Test: full pipeline from description to aggregate
/// Given a decomposition proposal and per-node outputs
/// When the pipeline runs end to end
/// Then the aggregate carries every node's output under its name
#[tokio::test]
async fn test_pipeline_aggregates_outputs_by_name() {
    let mut harness = EngineHarness::new(fast_config());
    harness
        .brain
        .set_behavior("gather", NodeBehavior::succeed(json!({"count": 4})));
    harness
        .brain
        .set_behavior("write", NodeBehavior::succeed(json!({"report": "full"})));

    let dag = harness
        .decompose(linear_proposal(&["gather", "write"]))
        .await;
    let mut executor = harness.executor(dag).await;
    let output = executor.execute().await.unwrap();

    assert_eq!(output["gather"]["count"], 4);
    assert_eq!(output["write"]["report"], "full");

    harness.teardown().await;
}
