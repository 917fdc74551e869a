//! JSON persistence for engine state.
//!
//! ExecutionDAGs, workflow runs, and the agent registry are snapshotted
//! to the state directory so in-flight work and health history survive a
//! process restart. Messages are intentionally not persisted; they are
//! not durable beyond delivery.
//!
//! Layout under the state dir:
//!   dags/<task-id>.json
//!   runs/<run-id>.json
//!   registry.json

use crate::core::dag::DagSnapshot;
use crate::core::task::TaskId;
use crate::error::Result;
use crate::executor::{RunId, WorkflowRun};
use crate::registry::RegistrySnapshot;
use std::fs;
use std::path::{Path, PathBuf};

/// File-backed snapshot store.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) a store rooted at the given path.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("dags"))?;
        fs::create_dir_all(root.join("runs"))?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dag_path(&self, task_id: &TaskId) -> PathBuf {
        self.root.join("dags").join(format!("{}.json", task_id))
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", run_id))
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    /// Persist a DAG snapshot, replacing any previous one for the task.
    pub fn save_dag(&self, snapshot: &DagSnapshot) -> Result<()> {
        write_json(&self.dag_path(&snapshot.task_id), snapshot)
    }

    /// Load the DAG snapshot for a task, if one was persisted.
    pub fn load_dag(&self, task_id: &TaskId) -> Result<Option<DagSnapshot>> {
        read_json(&self.dag_path(task_id))
    }

    /// Persist a workflow run.
    pub fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        write_json(&self.run_path(&run.id), run)
    }

    /// Load a workflow run by id.
    pub fn load_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>> {
        read_json(&self.run_path(run_id))
    }

    /// Load every persisted run, newest file first not guaranteed.
    pub fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(self.root.join("runs"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(run) = read_json(&path)? {
                    runs.push(run);
                }
            }
        }
        Ok(runs)
    }

    /// Persist the agent registry.
    pub fn save_registry(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        write_json(&self.registry_path(), snapshot)
    }

    /// Load the persisted registry, if any.
    pub fn load_registry(&self) -> Result<Option<RegistrySnapshot>> {
        read_json(&self.registry_path())
    }
}

/// Write via a temp file and rename so a crash mid-write never leaves a
/// truncated snapshot behind.
fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
}
