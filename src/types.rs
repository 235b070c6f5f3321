//! Domain model: work items, workers, templates, and the small value types
//! the scheduling core passes between components.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a work item. The core never parses or constructs
/// these; the host assigns them (database id, slug, whatever fits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemId(pub String);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of work a work item represents. Drives both the priority
/// formula's type weight and the template capability filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    Bug,
    Feature,
    Task,
    Research,
}

impl WorkItemType {
    /// Base priority weight for this type (spec.md §4.1).
    pub fn priority_weight(self) -> i64 {
        match self {
            WorkItemType::Bug => 100,
            WorkItemType::Feature => 50,
            WorkItemType::Task => 30,
            WorkItemType::Research => 10,
        }
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Backlog,
    Ready,
    InProgress,
    Review,
    Done,
}

/// The phase a worker plays on a given item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Refiner,
    Implementer,
    Tester,
    Reviewer,
}

/// Status of a worker, as reported by the external Worker Pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Paused,
    Error,
    Terminated,
}

/// Capability filter carried by a template: either every type is allowed,
/// or an explicit allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    Wildcard,
    Types(Vec<WorkItemType>),
}

impl Capability {
    pub fn allows(&self, item_type: WorkItemType) -> bool {
        match self {
            Capability::Wildcard => true,
            Capability::Types(types) => types.contains(&item_type),
        }
    }
}

/// A capability descriptor constraining which work-item types a worker can
/// accept and its default role. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub allowed_types: Capability,
    pub default_role: Option<Role>,
}

/// A unit of work. Identified by an opaque string; see spec.md §3 for the
/// full invariant list (the driver loop is the sole writer of `status`,
/// `started_at`, `completed_at` among core-owned transitions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub item_type: WorkItemType,
    pub status: WorkItemStatus,
    pub repository_id: Option<String>,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub success_criteria: Vec<String>,
    pub linked_files: Vec<String>,
    pub blocked_by: Vec<WorkItemId>,
    pub child_ids: Vec<WorkItemId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Age in whole hours since creation, used by the priority formula.
    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_hours().max(0)
    }
}

/// A partial update to a work item, applied through the Workflow interface.
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItemPatch {
    pub status: Option<WorkItemStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A long-lived compute agent that executes work items under a template.
/// Owned by the external Worker Pool; the core reads these fields and asks
/// the pool to mutate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub template: Template,
    pub status: WorkerStatus,
    pub context_used: u64,
    pub context_limit: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub tool_call_count: u64,
    pub error_count: u64,
    pub current_assignment: Option<(WorkItemId, Role)>,
}

impl Worker {
    /// Cost per token consumed so far, or `None` if the worker hasn't used
    /// any tokens yet (spec.md §4.2's cost-efficiency factor).
    pub fn cost_per_token(&self) -> Option<f64> {
        if self.tokens_used == 0 {
            None
        } else {
            Some(self.cost_usd / self.tokens_used as f64)
        }
    }
}
