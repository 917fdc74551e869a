//! Execution DAG for dependency management.
//!
//! This module provides the ExecutionDAG structure that holds one task's
//! subtask nodes as a directed acyclic graph, enabling parallel execution
//! of independent nodes while dependencies serialize the rest.

use crate::core::gate::QualityGate;
use crate::core::subtask::{NodeId, SubtaskNode};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Why one node must complete before another can start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyKind {
    /// Downstream node consumes the upstream node's output.
    DataFlow,
    /// Pure ordering constraint with no data exchanged.
    Ordering {
        /// Reason for the ordering constraint.
        reason: String,
    },
}

impl Default for DependencyKind {
    fn default() -> Self {
        Self::DataFlow
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::DataFlow => write!(f, "data"),
            DependencyKind::Ordering { reason } => write!(f, "ordering: {}", reason),
        }
    }
}

/// One edge in serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: DependencyKind,
}

/// Serializable snapshot of an `ExecutionDAG` for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSnapshot {
    pub task_id: TaskId,
    pub nodes: Vec<SubtaskNode>,
    pub edges: Vec<DagEdge>,
    pub gates: Vec<QualityGate>,
}

/// The subtask dependency graph for one task.
///
/// ExecutionDAG uses petgraph's DiGraph to represent node dependencies.
/// Vertices are subtask nodes, edges carry the dependency kind. Quality
/// gates attached to nodes ride along so downstream readiness can take
/// them into account.
pub struct ExecutionDAG {
    /// The task this DAG belongs to.
    task_id: TaskId,
    /// The underlying directed graph.
    graph: DiGraph<SubtaskNode, DependencyKind>,
    /// Index mapping from NodeId to NodeIndex for fast lookups.
    node_index: HashMap<NodeId, NodeIndex>,
    /// Gates attached to nodes of this DAG.
    gates: Vec<QualityGate>,
}

impl ExecutionDAG {
    /// Create a new empty DAG for a task.
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            gates: Vec::new(),
        }
    }

    /// The task this DAG belongs to.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Add a node to the DAG.
    ///
    /// Returns the NodeIndex for the added node. If the node already
    /// exists (same NodeId), returns the existing NodeIndex.
    pub fn add_node(&mut self, node: SubtaskNode) -> NodeIndex {
        if let Some(&index) = self.node_index.get(&node.id) {
            return index;
        }

        let id = node.id;
        let index = self.graph.add_node(node);
        self.node_index.insert(id, index);
        index
    }

    /// Add a dependency between two nodes.
    ///
    /// The dependency indicates that `from` must complete before `to` can
    /// start. The edge is rejected if it would create a cycle.
    ///
    /// # Errors
    /// Returns an error if either node is not in the DAG or the edge
    /// would create a cycle.
    pub fn add_dependency(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        kind: DependencyKind,
    ) -> Result<()> {
        let from_index = *self
            .node_index
            .get(from)
            .ok_or(Error::NodeNotFound { id: *from })?;

        let to_index = *self
            .node_index
            .get(to)
            .ok_or(Error::NodeNotFound { id: *to })?;

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, kind);

        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "dependency from {} to {} would create a cycle",
                from.short(),
                to.short()
            )));
        }

        Ok(())
    }

    /// Attach a quality gate to this DAG.
    pub fn attach_gate(&mut self, gate: QualityGate) {
        self.gates.push(gate);
    }

    /// Gates covering the given node.
    pub fn gates_for(&self, id: &NodeId) -> Vec<&QualityGate> {
        self.gates.iter().filter(|g| g.covers(id)).collect()
    }

    /// All gates attached to this DAG.
    pub fn gates(&self) -> &[QualityGate] {
        &self.gates
    }

    /// Get a reference to a node by its ID.
    pub fn get_node(&self, id: &NodeId) -> Option<&SubtaskNode> {
        self.node_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a node by its ID.
    pub fn get_node_mut(&mut self, id: &NodeId) -> Option<&mut SubtaskNode> {
        if let Some(&index) = self.node_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    /// Get the number of nodes in the DAG.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if a dependency exists between two nodes.
    pub fn has_dependency(&self, from: &NodeId, to: &NodeId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.node_index.get(from), self.node_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Get all nodes the given node depends on (predecessors).
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<&SubtaskNode> {
        if let Some(&index) = self.node_index.get(id) {
            self.graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Get all nodes that depend on the given node (successors).
    pub fn dependents_of(&self, id: &NodeId) -> Vec<&SubtaskNode> {
        if let Some(&index) = self.node_index.get(id) {
            self.graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Get all nodes in the DAG.
    pub fn all_nodes(&self) -> Vec<&SubtaskNode> {
        self.graph.node_weights().collect()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a node.
    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node_index.contains_key(id)
    }

    /// Root nodes (no incoming dependencies).
    pub fn roots(&self) -> Vec<&SubtaskNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Validate the DAG against construction invariants.
    ///
    /// Checks: non-empty, node count within `max_nodes`, every node
    /// carries at least one capability tag. Acyclicity holds by
    /// construction since `add_dependency` rejects cycles.
    pub fn validate(&self, max_nodes: usize) -> Result<()> {
        if self.is_empty() {
            return Err(Error::Validation("DAG has no nodes".to_string()));
        }
        if self.node_count() > max_nodes {
            return Err(Error::Validation(format!(
                "DAG has {} nodes, cap is {}",
                self.node_count(),
                max_nodes
            )));
        }
        for node in self.all_nodes() {
            if node.required_capabilities.is_empty() {
                return Err(Error::Validation(format!(
                    "node {} has no capability tags",
                    node.name
                )));
            }
        }
        Ok(())
    }

    // ========== Scheduling Operations ==========

    /// Get all nodes whose upstream dependencies are satisfied.
    ///
    /// A dependency is satisfied when its node is in the `satisfied` set,
    /// which the executor maintains as completed-and-gate-passed. Nodes
    /// already satisfied, in flight, or terminally finished are excluded.
    pub fn ready_nodes<'a>(&'a self, satisfied: &HashSet<NodeId>) -> Vec<&'a SubtaskNode> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let node = self.graph.node_weight(index)?;

                if satisfied.contains(&node.id) || node.is_in_flight() || node.is_finished() {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .all(|dep_index| {
                        self.graph
                            .node_weight(dep_index)
                            .map(|dep| satisfied.contains(&dep.id))
                            .unwrap_or(false)
                    });

                if deps_satisfied {
                    Some(node)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Check if every node in the DAG is in the satisfied set.
    pub fn all_satisfied(&self, satisfied: &HashSet<NodeId>) -> bool {
        self.node_index.keys().all(|id| satisfied.contains(id))
    }

    /// Get the count of not-yet-satisfied nodes.
    pub fn pending_count(&self, satisfied: &HashSet<NodeId>) -> usize {
        self.node_index
            .keys()
            .filter(|id| !satisfied.contains(id))
            .count()
    }

    /// Get nodes in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle (should never
    /// happen since add_dependency validates against cycles).
    pub fn topological_order(&self) -> Result<Vec<&SubtaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|n| n.name.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("cycle detected at node: {}", name))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    // ========== Persistence ==========

    /// Produce a serializable snapshot of this DAG.
    pub fn snapshot(&self) -> DagSnapshot {
        let nodes = self.graph.node_weights().cloned().collect();
        let edges = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.graph.edge_endpoints(e)?;
                Some(DagEdge {
                    from: self.graph.node_weight(a)?.id,
                    to: self.graph.node_weight(b)?.id,
                    kind: self.graph.edge_weight(e)?.clone(),
                })
            })
            .collect();
        DagSnapshot {
            task_id: self.task_id,
            nodes,
            edges,
            gates: self.gates.clone(),
        }
    }

    /// Rebuild a DAG from a snapshot.
    ///
    /// # Errors
    /// Returns an error if the snapshot references unknown nodes or
    /// contains a cycle.
    pub fn from_snapshot(snapshot: DagSnapshot) -> Result<Self> {
        let mut dag = Self::new(snapshot.task_id);
        for node in snapshot.nodes {
            dag.add_node(node);
        }
        for edge in snapshot.edges {
            dag.add_dependency(&edge.from, &edge.to, edge.kind)?;
        }
        for gate in snapshot.gates {
            dag.attach_gate(gate);
        }
        Ok(dag)
    }
}

impl std::fmt::Debug for ExecutionDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionDAG")
            .field("task", &self.task_id.short())
            .field("nodes", &self.node_count())
            .field("dependencies", &self.dependency_count())
            .field("gates", &self.gates.len())
            .finish()
    }
}
