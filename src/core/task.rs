//! Task data model.
//!
//! A `Task` is the user-submitted unit of work the engine decomposes and
//! executes. Only the workflow executor transitions a task into a
//! terminal outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a submitted task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Priority of a submitted task.
///
/// Priority orders message shedding on the bus and tie-breaks dispatch
/// when multiple runs contend for the same agents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Terminal outcome of a task.
///
/// Every failure variant carries the outputs of the subtasks that did
/// complete, so partial value is never lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    /// All subtasks completed and all gates passed.
    Completed {
        /// Aggregated output keyed by subtask name.
        output: serde_json::Value,
    },
    /// One or more subtasks failed terminally.
    Failed {
        /// Description of the terminal failure.
        error: String,
        /// Outputs of the subtasks that did complete.
        partial_output: serde_json::Value,
    },
    /// The task was cancelled by its owner.
    Cancelled,
}

/// A user-submitted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Raw natural-language description of the work.
    pub description: String,
    /// Scheduling priority.
    pub priority: Priority,
    /// Optional deadline after which the task loses value.
    pub deadline: Option<DateTime<Utc>>,
    /// Reference to whoever submitted the task.
    pub requester: String,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// Terminal outcome, set exactly once by the executor.
    pub outcome: Option<TaskOutcome>,
}

impl Task {
    /// Create a new task with the given description and requester.
    ///
    /// The task is created with Normal priority, no deadline, and no
    /// outcome.
    pub fn new(description: &str, requester: &str) -> Self {
        Self {
            id: TaskId::new(),
            description: description.to_string(),
            priority: Priority::Normal,
            deadline: None,
            requester: requester.to_string(),
            created_at: Utc::now(),
            outcome: None,
        }
    }

    /// Set the priority, builder-style.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a deadline, builder-style.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Record a successful terminal outcome.
    pub fn complete(&mut self, output: serde_json::Value) {
        self.outcome = Some(TaskOutcome::Completed { output });
    }

    /// Record a failed terminal outcome with whatever partial output exists.
    pub fn fail(&mut self, error: &str, partial_output: serde_json::Value) {
        self.outcome = Some(TaskOutcome::Failed {
            error: error.to_string(),
            partial_output,
        });
    }

    /// Record cancellation.
    pub fn cancel(&mut self) {
        self.outcome = Some(TaskOutcome::Cancelled);
    }

    /// Check if the task has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}
