//! In-memory fakes of the five consumed interfaces, modeled on the reference
//! codebase's `TestJobManager` / `MockJobHandler` pattern
//! (`kernel/jobs/manager.rs`). Always compiled, not feature-gated, so host
//! applications can exercise the driver loop without a database, a worker
//! pool, or a real executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::interfaces::{
    ErrorHook, ExecutionContext, ExecutionResult, Executor, ObservabilitySink, PostExecutionHook, PreExecutionHook,
    ProgressPublisher, WorkStore, Workflow, WorkerPool,
};
use crate::progress::ProgressEvent;
use crate::types::{Role, WorkItem, WorkItemId, WorkItemPatch, WorkItemStatus, Worker, WorkerId};

/// In-memory work-item store keyed by id.
#[derive(Default)]
pub struct FakeWorkStore {
    items: Mutex<Vec<WorkItem>>,
}

impl FakeWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, item: WorkItem) {
        self.items.lock().unwrap().push(item);
    }

    pub fn get(&self, id: &WorkItemId) -> Option<WorkItem> {
        self.items.lock().unwrap().iter().find(|i| &i.id == id).cloned()
    }
}

#[async_trait]
impl WorkStore for FakeWorkStore {
    async fn find_by_status(&self, status: WorkItemStatus) -> anyhow::Result<Vec<WorkItem>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: &WorkItemId) -> anyhow::Result<Option<WorkItem>> {
        Ok(self.get(id))
    }

    async fn find_by_ids(&self, ids: &[WorkItemId]) -> anyhow::Result<Vec<WorkItem>> {
        let items = self.items.lock().unwrap();
        Ok(ids.iter().filter_map(|id| items.iter().find(|i| &i.id == id).cloned()).collect())
    }

    async fn update(&self, id: &WorkItemId, patch: WorkItemPatch) -> anyhow::Result<()> {
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.iter_mut().find(|i| &i.id == id) {
            if let Some(status) = patch.status {
                item.status = status;
            }
            if let Some(started_at) = patch.started_at {
                item.started_at = Some(started_at);
            }
            if let Some(completed_at) = patch.completed_at {
                item.completed_at = Some(completed_at);
            }
        }
        Ok(())
    }
}

/// In-memory worker pool keyed by id.
#[derive(Default)]
pub struct FakeWorkerPool {
    workers: Mutex<Vec<Worker>>,
    can_spawn: Mutex<bool>,
}

impl FakeWorkerPool {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            can_spawn: Mutex::new(false),
        }
    }

    pub fn seed(&self, worker: Worker) {
        self.workers.lock().unwrap().push(worker);
    }

    pub fn set_can_spawn(&self, value: bool) {
        *self.can_spawn.lock().unwrap() = value;
    }
}

#[async_trait]
impl WorkerPool for FakeWorkerPool {
    async fn available_workers(&self) -> anyhow::Result<Vec<Worker>> {
        Ok(self
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.status == crate::types::WorkerStatus::Idle)
            .cloned()
            .collect())
    }

    async fn assign_work(&self, worker_id: &WorkerId, item_id: &WorkItemId, role: Role) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().unwrap();
        if let Some(w) = workers.iter_mut().find(|w| &w.id == worker_id) {
            w.status = crate::types::WorkerStatus::Working;
            w.current_assignment = Some((item_id.clone(), role));
        }
        Ok(())
    }

    async fn report_error(&self, worker_id: &WorkerId, _message: &str) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().unwrap();
        if let Some(w) = workers.iter_mut().find(|w| &w.id == worker_id) {
            w.error_count += 1;
            // A real pool recycles the worker once it has logged the
            // failure; mirror that here so scripted retries have someone to
            // dispatch to on the next cycle.
            w.status = crate::types::WorkerStatus::Idle;
            w.current_assignment = None;
        }
        Ok(())
    }

    async fn can_spawn_more(&self) -> anyhow::Result<bool> {
        Ok(*self.can_spawn.lock().unwrap())
    }

    async fn spawn(&self, _template_id: &str, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory workflow: records every transition requested, in order.
///
/// Optionally linked to a [`FakeWorkStore`], mirroring how a real Workflow
/// implementation and the Work Store it reads from are typically backed by
/// the same database — so that `queue.refresh()` observes the status
/// changes this component requests.
#[derive(Default)]
pub struct FakeWorkflow {
    transitions: Mutex<Vec<(WorkItemId, WorkItemStatus)>>,
    assignments: Mutex<Vec<(WorkItemId, WorkerId, Role)>>,
    linked_store: Option<Arc<FakeWorkStore>>,
}

impl FakeWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `FakeWorkflow` whose transitions are also applied to `store`.
    pub fn linked_to(store: Arc<FakeWorkStore>) -> Self {
        Self {
            transitions: Mutex::new(Vec::new()),
            assignments: Mutex::new(Vec::new()),
            linked_store: Some(store),
        }
    }

    pub fn transitions_for(&self, id: &WorkItemId) -> Vec<WorkItemStatus> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn assignments(&self) -> Vec<(WorkItemId, WorkerId, Role)> {
        self.assignments.lock().unwrap().clone()
    }
}

#[async_trait]
impl Workflow for FakeWorkflow {
    async fn assign_work_to_agent(&self, item_id: &WorkItemId, worker_id: &WorkerId, role: Role) -> anyhow::Result<()> {
        self.assignments
            .lock()
            .unwrap()
            .push((item_id.clone(), worker_id.clone(), role));
        Ok(())
    }

    async fn complete_work(&self, _item_id: &WorkItemId, _worker_id: &WorkerId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn transition(&self, item_id: &WorkItemId, target_status: WorkItemStatus) -> anyhow::Result<()> {
        self.transitions.lock().unwrap().push((item_id.clone(), target_status));
        if let Some(store) = &self.linked_store {
            store
                .update(
                    item_id,
                    WorkItemPatch {
                        status: Some(target_status),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }
}

/// Queue of pre-programmed results, one consumed per `execute` call, so
/// tests can script retries/exhaustion/success sequences per work item.
#[derive(Default)]
pub struct FakeExecutor {
    scripted: Mutex<VecDeque<anyhow::Result<ExecutionResult>>>,
    calls: Mutex<Vec<WorkItemId>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: ExecutionResult) {
        self.scripted.lock().unwrap().push_back(Ok(result));
    }

    pub fn push_error(&self, err: anyhow::Error) {
        self.scripted.lock().unwrap().push_back(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<ExecutionResult> {
        self.calls.lock().unwrap().push(ctx.item.id.clone());
        self.scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutionResult {
                execution_id: "fake-exec".into(),
                status: crate::interfaces::ExecutionStatus::Success,
                error: None,
                tokens_used: 0,
                cost_usd: 0.0,
                tool_calls_count: 0,
            }))
    }
}

/// Records every work-item update observed, for assertions.
#[derive(Default)]
pub struct FakeObservabilitySink {
    updates: Mutex<Vec<WorkItemId>>,
}

impl FakeObservabilitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<WorkItemId> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObservabilitySink for FakeObservabilitySink {
    async fn record_update(&self, id: &WorkItemId, _patch: &WorkItemPatch) {
        self.updates.lock().unwrap().push(id.clone());
    }
}

/// Records every progress event published, for assertions.
#[derive(Default)]
pub struct FakeProgressPublisher {
    published: Mutex<Vec<ProgressEvent>>,
}

impl FakeProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<ProgressEvent> {
        self.published.lock().unwrap().clone()
    }
}

impl ProgressPublisher for FakeProgressPublisher {
    fn publish(&self, event: &ProgressEvent) {
        self.published.lock().unwrap().push(event.clone());
    }
}

/// A pre-execution hook that always allows, recording how many times it ran.
#[derive(Default)]
pub struct AllowAllPreHook {
    calls: Mutex<u64>,
}

impl AllowAllPreHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u64 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl PreExecutionHook for AllowAllPreHook {
    async fn check(&self, _ctx: &ExecutionContext) -> anyhow::Result<bool> {
        *self.calls.lock().unwrap() += 1;
        Ok(true)
    }
}

/// A post-execution hook that records invocation count.
#[derive(Default)]
pub struct CountingPostHook {
    calls: Mutex<u64>,
}

impl CountingPostHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u64 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl PostExecutionHook for CountingPostHook {
    async fn run(&self, _ctx: &ExecutionContext, _result: &ExecutionResult) {
        *self.calls.lock().unwrap() += 1;
    }
}

/// An error hook that records invocation count.
#[derive(Default)]
pub struct CountingErrorHook {
    calls: Mutex<u64>,
}

impl CountingErrorHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u64 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ErrorHook for CountingErrorHook {
    async fn run(&self, _ctx: &ExecutionContext, _error: &str) {
        *self.calls.lock().unwrap() += 1;
    }
}
