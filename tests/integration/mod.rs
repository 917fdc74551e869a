//! Integration test suite for the foreman engine.
//!
//! These tests exercise the full pipeline from task submission to a
//! terminal run status: decomposition, assignment, bus delivery, gate
//! review, and self-healing recovery. They verify that all components
//! work together correctly.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution tests
//! - `parallel_agents`: Concurrency and dependency-order correctness
//! - `messaging`: Bus delivery, escalation, and idempotence
//! - `recovery`: Self-healing and replacement tests
//! - `performance`: Loose latency and throughput thresholds
//!
//! # CI Compatibility
//!
//! These tests use the scripted brain and never invoke an external
//! agent binary, making them safe to run in CI environments.

mod fixtures;

mod workflow_e2e;
mod parallel_agents;
mod messaging;
mod recovery;
mod performance;
