//! The five interfaces the core consumes, and the one it exposes.
//!
//! The core treats persistence, the worker pool, workflow transitions, agent
//! execution, and every sink as black boxes behind these traits — policy
//! (scoring, retry, fairness) lives in this crate; everything else is the
//! host's problem. This mirrors the policy-light trait boundary the
//! reference coordination layer draws around its own `JobStore` trait.

use anyhow::Result;
use async_trait::async_trait;

use crate::progress::ProgressEvent;
use crate::types::{Role, WorkItem, WorkItemId, WorkItemPatch, WorkItemStatus, Worker, WorkerId};

/// Work-item store (consumed). Read-only from the core's view except for
/// targeted status writes through [`Workflow`].
#[async_trait]
pub trait WorkStore: Send + Sync {
    async fn find_by_status(&self, status: WorkItemStatus) -> Result<Vec<WorkItem>>;
    async fn find_by_id(&self, id: &WorkItemId) -> Result<Option<WorkItem>>;
    async fn find_by_ids(&self, ids: &[WorkItemId]) -> Result<Vec<WorkItem>>;
    async fn update(&self, id: &WorkItemId, patch: WorkItemPatch) -> Result<()>;
}

/// Worker pool (consumed). Enumerates workers, their liveness, and resource
/// counters; the core never mutates a worker directly.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn available_workers(&self) -> Result<Vec<Worker>>;
    async fn assign_work(&self, worker_id: &WorkerId, item_id: &WorkItemId, role: Role) -> Result<()>;
    async fn report_error(&self, worker_id: &WorkerId, message: &str) -> Result<()>;
    async fn can_spawn_more(&self) -> Result<bool>;
    async fn spawn(&self, template_id: &str, session_id: &str) -> Result<()>;
}

/// Workflow (consumed). The only status transitions the core will request
/// are to `backlog` (after retry exhaustion) and to `review` / `in_progress`
/// (via progress updates that delegate to this interface).
#[async_trait]
pub trait Workflow: Send + Sync {
    async fn assign_work_to_agent(&self, item_id: &WorkItemId, worker_id: &WorkerId, role: Role) -> Result<()>;
    async fn complete_work(&self, item_id: &WorkItemId, worker_id: &WorkerId) -> Result<()>;
    async fn transition(&self, item_id: &WorkItemId, target_status: WorkItemStatus) -> Result<()>;
}

/// Context handed to the executor for a single dispatch.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub item: WorkItem,
    pub worker_id: WorkerId,
    pub role: Role,
}

/// Terminal status of an executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Error,
    Cancelled,
}

/// The structured result the Executor interface reports back, logically
/// asynchronously (the implementation may be backed by a future or a
/// callback on the host side; this crate only sees the eventual value).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub tool_calls_count: u64,
}

/// Executor (consumed). Exceptions raised while dispatching (before a
/// structured result comes back) are treated identically to a result with
/// `status = Error` by the driver loop (spec.md §7).
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult>;
}

/// Pre-execution hook: may veto a dispatch before it starts.
#[async_trait]
pub trait PreExecutionHook: Send + Sync {
    async fn check(&self, ctx: &ExecutionContext) -> Result<bool>;
}

/// Post-execution hook: observes a successful result.
#[async_trait]
pub trait PostExecutionHook: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext, result: &ExecutionResult);
}

/// Error hook: observes a failed or cancelled dispatch.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext, error: &str);
}

/// Sink that records work-item updates for observability. Best-effort: a
/// failure here must never break execution.
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    async fn record_update(&self, id: &WorkItemId, patch: &WorkItemPatch);
}

/// Publishes progress events to external subscribers (e.g. a WebSocket
/// fan-out), keyed by work-item id. Best-effort.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: &ProgressEvent);
}
