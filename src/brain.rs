//! The reasoning capability behind every agent.
//!
//! The engine treats the "intelligence" of a worker as an opaque,
//! possibly slow, possibly failing call behind the `Reasoning` trait:
//! `propose` turns a task description into candidate subtasks, `execute`
//! runs one assigned subtask. `CommandBrain` shells out to an external
//! agent binary in headless mode with JSON output; `ScriptedBrain` is a
//! deterministic implementation for tests and demos.

use crate::core::subtask::{Capability, Layer, NodeId};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for one external brain invocation (10 minutes).
pub const DEFAULT_BRAIN_TIMEOUT_SECS: u64 = 600;

/// What the decomposer asks a brain to plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBrief {
    /// The task being decomposed.
    pub task_id: TaskId,
    /// Natural-language description of the work.
    pub description: String,
    /// Upper bound on proposed nodes.
    pub max_nodes: usize,
    /// Set on the retry after an invalid proposal; asks for a smaller,
    /// simpler plan.
    pub simplified: bool,
}

/// One subtask a brain proposes. Dependencies are indices into the
/// proposal's node list, which makes cycles impossible to express only
/// if the brain behaves; the decomposer still validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedNode {
    pub name: String,
    pub description: String,
    pub capabilities: BTreeSet<Capability>,
    pub layer: Layer,
    pub estimated_secs: u64,
    pub depends_on: Vec<usize>,
}

/// A candidate decomposition returned by `propose`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Proposal {
    pub nodes: Vec<ProposedNode>,
}

/// One unit of work handed to `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub node_id: NodeId,
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    pub input: serde_json::Value,
}

/// The opaque reasoning capability invoked by the engine.
#[async_trait]
pub trait Reasoning: Send + Sync {
    /// Propose a decomposition for a task.
    async fn propose(&self, brief: &TaskBrief) -> Result<Proposal>;

    /// Execute one assigned subtask, returning its output payload.
    async fn execute(&self, order: &WorkOrder) -> Result<serde_json::Value>;
}

/// Internal struct for deserializing the external command's response.
#[derive(Debug, Deserialize)]
struct RawBrainResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Reasoning via an external agent binary in headless mode.
///
/// Runs `<command> -p <prompt> --output-format json`, parses the JSON
/// response, and maps it onto the `Reasoning` contract. The command is
/// configurable; the binary is resolved through `which` at construction.
pub struct CommandBrain {
    /// Resolved path to the binary.
    binary: PathBuf,
    /// Leading arguments taken from the configured command line.
    base_args: Vec<String>,
    /// Timeout for one invocation.
    timeout: Duration,
}

impl CommandBrain {
    /// Create a brain from a configured command line such as
    /// `"claude --dangerously-skip-permissions"`.
    ///
    /// # Errors
    /// Returns an error if the command is empty or its binary cannot be
    /// found on the path.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let binary_name = parts
            .next()
            .ok_or_else(|| Error::BrainBinaryNotFound("<empty command>".to_string()))?;
        let binary = which::which(&binary_name)
            .map_err(|_| Error::BrainBinaryNotFound(binary_name.clone()))?;

        Ok(Self {
            binary,
            base_args: parts.collect(),
            timeout: Duration::from_secs(DEFAULT_BRAIN_TIMEOUT_SECS),
        })
    }

    /// Set a custom timeout for invocations.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn invoke(&self, prompt: &str) -> Result<serde_json::Value> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(&self.base_args)
                .arg("-p")
                .arg(prompt)
                .arg("--output-format")
                .arg("json")
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if let Ok(raw) = serde_json::from_str::<RawBrainResponse>(&stdout) {
            if let Some(error) = raw.error {
                return Err(Error::Validation(format!("brain error: {}", error)));
            }
            if let Some(result) = raw.result {
                return Ok(result);
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Validation(format!(
                "brain exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        // Non-JSON success output; wrap it.
        Ok(serde_json::Value::String(stdout.trim().to_string()))
    }

    fn propose_prompt(brief: &TaskBrief) -> String {
        let size_hint = if brief.simplified {
            "Keep the plan minimal: as few nodes as possible, prefer a linear order."
        } else {
            "Prefer independent nodes where the work genuinely parallelizes."
        };
        format!(
            r#"Decompose this task into subtasks and respond with JSON only.

TASK:
{}

Respond with an object {{"nodes": [...]}} where each node has:
  name, description, capabilities (subset of {:?}),
  layer (one of executive/management/specialist/execution),
  estimated_secs, depends_on (indices of earlier nodes).

At most {} nodes. {}"#,
            brief.description,
            Capability::all(),
            brief.max_nodes,
            size_hint
        )
    }

    fn execute_prompt(order: &WorkOrder) -> String {
        format!(
            r#"Execute this subtask and respond with a JSON object describing the result.

SUBTASK: {}
DETAIL: {}
INPUT:
{}"#,
            order.name, order.description, order.input
        )
    }
}

#[async_trait]
impl Reasoning for CommandBrain {
    async fn propose(&self, brief: &TaskBrief) -> Result<Proposal> {
        let value = self.invoke(&Self::propose_prompt(brief)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn execute(&self, order: &WorkOrder) -> Result<serde_json::Value> {
        self.invoke(&Self::execute_prompt(order)).await
    }
}

/// Scripted response for one `propose` call.
#[derive(Debug, Clone)]
pub enum ScriptedPropose {
    /// Return this proposal.
    Propose(Proposal),
    /// Simulate a brain that cannot plan the task.
    Empty,
    /// Simulate an unresponsive brain; sleeps well past any test timeout.
    Hang,
}

/// Per-node execution behavior for a `ScriptedBrain`.
#[derive(Debug, Clone)]
pub struct NodeBehavior {
    /// Fail this many executions before succeeding.
    pub fail_remaining: u32,
    /// Hang (never return) for this many executions before succeeding.
    pub hang_remaining: u32,
    /// Artificial latency before a successful return.
    pub delay: Duration,
    /// Output produced on success.
    pub output: serde_json::Value,
}

impl Default for NodeBehavior {
    fn default() -> Self {
        Self {
            fail_remaining: 0,
            hang_remaining: 0,
            delay: Duration::ZERO,
            output: serde_json::json!({"done": true}),
        }
    }
}

impl NodeBehavior {
    /// Succeed immediately with the given output.
    pub fn succeed(output: serde_json::Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    /// Fail `n` times, then succeed with the given output.
    pub fn fail_times(n: u32, output: serde_json::Value) -> Self {
        Self {
            fail_remaining: n,
            output,
            ..Default::default()
        }
    }

    /// Hang on the first `n` executions, then succeed.
    pub fn hang_times(n: u32, output: serde_json::Value) -> Self {
        Self {
            hang_remaining: n,
            output,
            ..Default::default()
        }
    }

    /// Add artificial latency to successful executions.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Deterministic `Reasoning` for tests and the demo CLI.
///
/// Proposals are served from a queue; executions look up a behavior by
/// node name. Every execution is recorded so tests can assert on
/// duplicate side effects.
#[derive(Default)]
pub struct ScriptedBrain {
    proposals: Mutex<VecDeque<ScriptedPropose>>,
    behaviors: Mutex<HashMap<String, NodeBehavior>>,
    executions: Mutex<Vec<String>>,
}

impl ScriptedBrain {
    /// Create a brain with no scripted proposals and default behaviors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next `propose` call.
    pub fn push_proposal(&self, scripted: ScriptedPropose) {
        self.proposals
            .lock()
            .expect("proposal queue poisoned")
            .push_back(scripted);
    }

    /// Set the execution behavior for a node name.
    pub fn set_behavior(&self, name: &str, behavior: NodeBehavior) {
        self.behaviors
            .lock()
            .expect("behavior map poisoned")
            .insert(name.to_string(), behavior);
    }

    /// How many times the named node was executed to completion or
    /// failure (hanging executions are counted when they start).
    pub fn execution_count(&self, name: &str) -> usize {
        self.executions
            .lock()
            .expect("execution log poisoned")
            .iter()
            .filter(|n| n.as_str() == name)
            .count()
    }

    /// Total number of recorded executions.
    pub fn total_executions(&self) -> usize {
        self.executions.lock().expect("execution log poisoned").len()
    }
}

#[async_trait]
impl Reasoning for ScriptedBrain {
    async fn propose(&self, _brief: &TaskBrief) -> Result<Proposal> {
        let next = self
            .proposals
            .lock()
            .expect("proposal queue poisoned")
            .pop_front();

        match next {
            Some(ScriptedPropose::Propose(proposal)) => Ok(proposal),
            Some(ScriptedPropose::Empty) | None => Ok(Proposal::default()),
            Some(ScriptedPropose::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Proposal::default())
            }
        }
    }

    async fn execute(&self, order: &WorkOrder) -> Result<serde_json::Value> {
        self.executions
            .lock()
            .expect("execution log poisoned")
            .push(order.name.clone());

        let decision = {
            let mut behaviors = self.behaviors.lock().expect("behavior map poisoned");
            let behavior = behaviors.entry(order.name.clone()).or_default();
            if behavior.hang_remaining > 0 {
                behavior.hang_remaining -= 1;
                Err(None)
            } else if behavior.fail_remaining > 0 {
                behavior.fail_remaining -= 1;
                Err(Some(format!("scripted failure for {}", order.name)))
            } else {
                Ok((behavior.delay, behavior.output.clone()))
            }
        };

        match decision {
            Ok((delay, output)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(output)
            }
            Err(Some(message)) => Err(Error::Validation(message)),
            Err(None) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Timeout(Duration::from_secs(3600)))
            }
        }
    }
}

/// Build a simple linear proposal, one node per step name.
///
/// Convenience for tests and the demo CLI: step N depends on step N-1,
/// every node is a specialist research node.
pub fn linear_proposal(steps: &[&str]) -> Proposal {
    Proposal {
        nodes: steps
            .iter()
            .enumerate()
            .map(|(i, name)| ProposedNode {
                name: name.to_string(),
                description: format!("{} step", name),
                capabilities: [Capability::Research].into_iter().collect(),
                layer: Layer::Specialist,
                estimated_secs: 60,
                depends_on: if i == 0 { vec![] } else { vec![i - 1] },
            })
            .collect(),
    }
}
