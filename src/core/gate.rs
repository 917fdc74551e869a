//! Quality gates.
//!
//! A gate is a pass/fail checkpoint attached to one or more subtask
//! nodes. Downstream nodes stay unready until every gate covering their
//! dependencies passes. Criteria are a closed enum so gates serialize
//! with the DAG and evaluation stays exhaustive.

use crate::core::subtask::{Layer, NodeId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateId(pub Uuid);

impl GateId {
    /// Create a new unique gate identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for GateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pass/fail predicate over a node's output payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum GateCriteria {
    /// Output must be present and not null/empty.
    OutputNonEmpty,
    /// Output object must contain the named field.
    RequiredField {
        /// Field that must be present.
        field: String,
    },
    /// Serialized output must be at least this many bytes.
    MinOutputBytes {
        /// Minimum size of the serialized output.
        bytes: usize,
    },
    /// The named field must equal the given value.
    FieldEquals {
        /// Field to inspect.
        field: String,
        /// Value the field must hold.
        value: serde_json::Value,
    },
    /// Every listed criterion must pass.
    All {
        /// Criteria combined conjunctively.
        criteria: Vec<GateCriteria>,
    },
}

impl GateCriteria {
    /// Evaluate the criterion against an output payload.
    pub fn evaluate(&self, output: &serde_json::Value) -> bool {
        match self {
            GateCriteria::OutputNonEmpty => match output {
                serde_json::Value::Null => false,
                serde_json::Value::String(s) => !s.is_empty(),
                serde_json::Value::Array(a) => !a.is_empty(),
                serde_json::Value::Object(o) => !o.is_empty(),
                _ => true,
            },
            GateCriteria::RequiredField { field } => output.get(field).is_some(),
            GateCriteria::MinOutputBytes { bytes } => {
                serde_json::to_string(output)
                    .map(|s| s.len() >= *bytes)
                    .unwrap_or(false)
            }
            GateCriteria::FieldEquals { field, value } => {
                output.get(field).map(|v| v == value).unwrap_or(false)
            }
            GateCriteria::All { criteria } => criteria.iter().all(|c| c.evaluate(output)),
        }
    }
}

/// A checkpoint gating downstream execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    /// Unique identifier for this gate.
    pub id: GateId,
    /// Nodes whose output this gate reviews.
    pub nodes: Vec<NodeId>,
    /// The pass/fail predicate.
    pub criteria: GateCriteria,
    /// Hierarchy layer that signs off on the gate.
    pub approver: Layer,
}

impl QualityGate {
    /// Create a gate over the given nodes.
    pub fn new(nodes: Vec<NodeId>, criteria: GateCriteria, approver: Layer) -> Self {
        Self {
            id: GateId::new(),
            nodes,
            criteria,
            approver,
        }
    }

    /// Check whether this gate covers the given node.
    pub fn covers(&self, id: &NodeId) -> bool {
        self.nodes.contains(id)
    }

    /// Evaluate the gate against a node's output.
    pub fn evaluate(&self, output: &serde_json::Value) -> bool {
        self.criteria.evaluate(output)
    }
}
