//! Engine configuration.
//!
//! All timeouts and bounds used by the engine live here so that the
//! per-message, per-node, and per-run limits stay independently tunable.
//! Configuration is read from `~/.foreman/foreman.toml` when present and
//! falls back to defaults otherwise.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Default cap on the number of nodes a decomposed DAG may contain.
pub const DEFAULT_MAX_DAG_NODES: usize = 64;

/// Default maximum number of agents the hierarchy manager will keep alive.
pub const DEFAULT_MAX_POOL_SIZE: usize = 16;

/// Default recovery budget for the self-healing coordinator, in seconds.
pub const DEFAULT_RECOVERY_BUDGET_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on DAG size accepted from the decomposer.
    pub max_dag_nodes: usize,
    /// Retries against the reasoning capability before a decomposition
    /// timeout is surfaced.
    pub decompose_retries: u32,
    /// Timeout for a single `propose` call, in seconds.
    pub decompose_timeout_secs: u64,

    /// Maximum number of live agents across all layers.
    pub max_pool_size: usize,
    /// Concurrent node assignments a single agent will accept.
    pub agent_max_concurrency: usize,

    /// Interval at which workers emit heartbeats, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Silence after which an agent is marked Degraded, in seconds.
    pub heartbeat_degraded_after_secs: u64,
    /// Silence after which an agent is marked Unresponsive, in seconds.
    pub heartbeat_unresponsive_after_secs: u64,

    /// Timeout for a single request/response exchange on the bus, in
    /// milliseconds.
    pub request_timeout_ms: u64,
    /// Timeout for a single node execution, in seconds.
    pub node_timeout_secs: u64,
    /// Wall-clock budget for a whole workflow run, in seconds.
    pub run_wall_clock_secs: u64,
    /// Attempts per node before the run is failed.
    pub node_retries: u32,
    /// Whether a gate rejection fails the whole run instead of consuming
    /// a node retry.
    pub fail_run_on_gate_reject: bool,

    /// Window within which a help request must be answered before it is
    /// escalated one layer up, in seconds.
    pub escalation_window_secs: u64,
    /// Maximum number of escalation hops before a failure notice is sent.
    pub max_escalation_hops: u32,
    /// Per-subscriber queue depth above which the bus starts shedding.
    pub queue_high_water: usize,

    /// Budget for replacement + re-dispatch after an agent failure, in
    /// seconds.
    pub recovery_budget_secs: u64,

    /// External command used by the production brain.
    pub brain_command: Option<String>,
    /// Override for the state directory.
    pub state_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_dag_nodes: DEFAULT_MAX_DAG_NODES,
            decompose_retries: 2,
            decompose_timeout_secs: 60,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            agent_max_concurrency: 2,
            heartbeat_interval_secs: 5,
            heartbeat_degraded_after_secs: 15,
            heartbeat_unresponsive_after_secs: 30,
            request_timeout_ms: 5000,
            node_timeout_secs: 300,
            run_wall_clock_secs: 3600,
            node_retries: 3,
            fail_run_on_gate_reject: false,
            escalation_window_secs: 30,
            max_escalation_hops: 2,
            queue_high_water: 256,
            recovery_budget_secs: DEFAULT_RECOVERY_BUDGET_SECS,
            brain_command: None,
            state_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    /// Directory for persisted DAG/run/registry snapshots.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("state")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn decompose_timeout(&self) -> Duration {
        Duration::from_secs(self.decompose_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_degraded_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_degraded_after_secs)
    }

    pub fn heartbeat_unresponsive_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_unresponsive_after_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn run_wall_clock(&self) -> Duration {
        Duration::from_secs(self.run_wall_clock_secs)
    }

    pub fn escalation_window(&self) -> Duration {
        Duration::from_secs(self.escalation_window_secs)
    }

    pub fn recovery_budget(&self) -> Duration {
        Duration::from_secs(self.recovery_budget_secs)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
