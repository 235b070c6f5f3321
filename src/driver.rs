//! Driver loop (spec.md §4.6): composes the five components and the
//! external interfaces into a periodic scheduling cycle.
//!
//! Grounded on the reference codebase's `JobWorker::run` (`kernel/jobs/worker.rs`):
//! a `tokio::select!` over a sleep and a `CancellationToken`, with the same
//! "cycle in progress finishes before stop takes effect" semantics.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{OrchestratorConfig, PartialOrchestratorConfig};
use crate::interfaces::{
    ErrorHook, ExecutionContext, ExecutionStatus, Executor, ObservabilitySink, PostExecutionHook, PreExecutionHook,
    ProgressPublisher, WorkStore, Workflow, WorkerPool,
};
use crate::ledger::ConcurrencyLedger;
use crate::progress::ProgressTracker;
use crate::queue::PriorityQueue;
use crate::retry::{LogEntry, LogLevel, RetryEngine};
use crate::scorer::AssignmentScorer;
use crate::types::WorkItem;

/// Observational snapshot returned by [`DriverLoop::status`].
#[derive(Debug, Clone)]
pub struct DriverStatus {
    pub running: bool,
    pub cycle_count: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: u64,
    pub queue_length: usize,
    pub active_assignments: usize,
    pub pending_retries: usize,
    pub ledger_global_count: usize,
}

/// The consumed interfaces, bundled for construction convenience.
pub struct Collaborators {
    pub store: Arc<dyn WorkStore>,
    pub pool: Arc<dyn WorkerPool>,
    pub workflow: Arc<dyn Workflow>,
    pub executor: Arc<dyn Executor>,
    pub observability: Arc<dyn ObservabilitySink>,
    pub publisher: Arc<dyn ProgressPublisher>,
}

/// Composes the priority queue, assignment scorer, progress tracker, retry
/// engine, and concurrency ledger into the periodic cycle described in
/// spec.md §4.6. `Arc<DriverLoop>` is the expected ownership shape: cloned
/// into the background cycle task and into each fire-and-continue executor
/// continuation.
pub struct DriverLoop {
    config: RwLock<OrchestratorConfig>,
    queue: PriorityQueue,
    scorer: AssignmentScorer,
    progress: ProgressTracker,
    retries: RetryEngine,
    ledger: ConcurrencyLedger,

    store: Arc<dyn WorkStore>,
    pool: Arc<dyn WorkerPool>,
    workflow: Arc<dyn Workflow>,
    executor: Arc<dyn Executor>,
    observability: Arc<dyn ObservabilitySink>,
    publisher: Arc<dyn ProgressPublisher>,

    pre_hooks: RwLock<Vec<Arc<dyn PreExecutionHook>>>,
    post_hooks: RwLock<Vec<Arc<dyn PostExecutionHook>>>,
    error_hooks: RwLock<Vec<Arc<dyn ErrorHook>>>,

    running: AtomicBool,
    cycle_count: AtomicU64,
    last_cycle_at: RwLock<Option<DateTime<Utc>>>,
    last_cycle_duration_ms: AtomicU64,
    cancel: AsyncMutex<Option<CancellationToken>>,
    /// Guards against two cycles running concurrently (spec.md §4.6:
    /// "cycles are not concurrent").
    cycle_lock: AsyncMutex<()>,
}

impl DriverLoop {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Arc<Self> {
        let ledger = ConcurrencyLedger::new(
            config.max_global_workers,
            config.max_workers_per_repo,
            config.max_workers_per_user,
        );
        let retries = RetryEngine::new(config.max_retry_attempts, config.retry_base_delay_ms, config.retry_max_delay_ms);
        let scorer = AssignmentScorer::new(config.scoring_weights);

        Arc::new(Self {
            config: RwLock::new(config),
            queue: PriorityQueue::new(),
            scorer,
            progress: ProgressTracker::new(),
            retries,
            ledger,
            store: collaborators.store,
            pool: collaborators.pool,
            workflow: collaborators.workflow,
            executor: collaborators.executor,
            observability: collaborators.observability,
            publisher: collaborators.publisher,
            pre_hooks: RwLock::new(Vec::new()),
            post_hooks: RwLock::new(Vec::new()),
            error_hooks: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            last_cycle_at: RwLock::new(None),
            last_cycle_duration_ms: AtomicU64::new(0),
            cancel: AsyncMutex::new(None),
            cycle_lock: AsyncMutex::new(()),
        })
    }

    pub fn register_pre_hook(&self, hook: Arc<dyn PreExecutionHook>) {
        self.pre_hooks.write().unwrap().push(hook);
    }

    pub fn register_post_hook(&self, hook: Arc<dyn PostExecutionHook>) {
        self.post_hooks.write().unwrap().push(hook);
    }

    pub fn register_error_hook(&self, hook: Arc<dyn ErrorHook>) {
        self.error_hooks.write().unwrap().push(hook);
    }

    pub fn retries(&self) -> &RetryEngine {
        &self.retries
    }

    pub fn ledger(&self) -> &ConcurrencyLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Runs the first cycle immediately, then schedules further cycles at
    /// `cycleIntervalMs`. Returns once the loop has been told to stop (via
    /// [`Self::stop`]); the task should typically be spawned.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *self.cancel.lock().await = Some(token.clone());

        info!("driver loop starting");
        loop {
            self.force_cycle().await;

            let interval_ms = self.config.read().unwrap().cycle_interval_ms;
            tokio::select! {
                _ = token.cancelled() => {
                    info!("driver loop stopping");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Signals the loop to stop after its current cycle (if any) finishes.
    /// Does not cancel an in-flight executor call.
    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
        }
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            running: self.running.load(Ordering::SeqCst),
            cycle_count: self.cycle_count.load(Ordering::SeqCst),
            last_cycle_at: *self.last_cycle_at.read().unwrap(),
            last_cycle_duration_ms: self.last_cycle_duration_ms.load(Ordering::SeqCst),
            queue_length: self.queue.length(),
            active_assignments: self.queue.processing_count(),
            pending_retries: self.retries.stats().pending_retries,
            ledger_global_count: self.ledger.status().global_count,
        }
    }

    /// Merges a partial configuration update. Only present fields replace
    /// the current value; in-flight state is unaffected.
    pub fn update_config(&self, patch: PartialOrchestratorConfig) {
        let mut config = self.config.write().unwrap();
        let max_global = patch.max_global_workers;
        let max_repo = patch.max_workers_per_repo;
        let max_user = patch.max_workers_per_user;
        let max_retry = patch.max_retry_attempts;
        let base_delay = patch.retry_base_delay_ms;
        let max_delay = patch.retry_max_delay_ms;
        let weights = patch.scoring_weights;

        config.apply(patch);

        if max_global.is_some() || max_repo.is_some() || max_user.is_some() {
            self.ledger.update_limits(max_global, max_repo, max_user);
        }
        if max_retry.is_some() || base_delay.is_some() || max_delay.is_some() {
            self.retries
                .update_limits(config.max_retry_attempts, config.retry_base_delay_ms, config.retry_max_delay_ms);
        }
        if let Some(weights) = weights {
            self.scorer.set_weights(weights);
        }
        info!("driver configuration updated");
    }

    /// Runs exactly one cycle, regardless of the scheduled interval.
    /// Cycles never overlap: a concurrent call blocks until the running one
    /// finishes.
    pub async fn force_cycle(self: &Arc<Self>) {
        let _guard = self.cycle_lock.lock().await;
        let started_at = Utc::now();

        if let Err(err) = self.queue.refresh(self.store.as_ref()).await {
            error!(error = %err, "queue refresh failed; cycle aborted");
        } else {
            self.promote_ready_retries().await;
            self.drain().await;
        }

        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        self.cycle_count.fetch_add(1, Ordering::SeqCst);
        *self.last_cycle_at.write().unwrap() = Some(started_at);
        self.last_cycle_duration_ms.store(duration_ms, Ordering::SeqCst);
        debug!(duration_ms, "cycle complete");
    }

    async fn promote_ready_retries(&self) {
        for ctx in self.retries.ready_retries() {
            match self.store.find_by_id(&ctx.work_item_id).await {
                Ok(Some(item)) => {
                    self.queue.push_retry(item, ctx.retry_count);
                    info!(work_item_id = %ctx.work_item_id, retry_count = ctx.retry_count, "promoted ready retry");
                }
                Ok(None) => warn!(work_item_id = %ctx.work_item_id, "ready retry points at missing work item"),
                Err(err) => error!(work_item_id = %ctx.work_item_id, error = %err, "failed to refetch work item for retry"),
            }
        }
    }

    async fn drain(self: &Arc<Self>) {
        let drain_budget = self.queue.length();
        for _ in 0..drain_budget {
            let Some(queue_item) = self.queue.next() else {
                break;
            };
            self.dispatch_one(queue_item).await;
        }
    }

    async fn dispatch_one(self: &Arc<Self>, queue_item: crate::queue::QueueItem) {
        let item = queue_item.item;
        let id = item.id.clone();

        let decision = self.ledger.may_start(&item);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "concurrency limit reached".to_string());
            warn!(work_item_id = %id, reason = %reason, "requeueing: concurrency limit");
            self.queue.requeue(&id, reason);
            return;
        }

        let role = self.scorer.determine_role(&item);
        let available = match self.pool.available_workers().await {
            Ok(workers) => workers,
            Err(err) => {
                error!(work_item_id = %id, error = %err, "worker pool lookup failed");
                self.queue.requeue(&id, format!("worker pool error: {err}"));
                return;
            }
        };

        let worker = self
            .scorer
            .find_best_worker(&item, role, &available, Utc::now())
            .cloned();

        let Some(worker) = worker else {
            warn!(work_item_id = %id, "no available workers");
            self.queue.requeue(&id, "no available workers");
            self.maybe_auto_spawn().await;
            return;
        };

        self.ledger.register_start(&item, &worker.id);

        if let Err(err) = self.workflow.assign_work_to_agent(&id, &worker.id, role).await {
            error!(work_item_id = %id, worker_id = %worker.id, error = %err, "workflow assignment failed");
        }
        if let Err(err) = self.pool.assign_work(&worker.id, &id, role).await {
            error!(work_item_id = %id, worker_id = %worker.id, error = %err, "pool assignment failed");
        }

        let ctx = ExecutionContext {
            item: item.clone(),
            worker_id: worker.id.clone(),
            role,
        };

        let allowed = self.run_pre_execution_hooks(&ctx).await;
        if !allowed {
            warn!(work_item_id = %id, worker_id = %worker.id, "pre-execution hook blocked dispatch");
            self.ledger.register_complete(&item, &worker.id);
            self.handle_executor_error(
                item,
                worker.id,
                queue_item.retry_count,
                "blocked by pre-execution hook".to_string(),
                Some(crate::error::ErrorCategory::Validation),
            )
            .await;
            return;
        }

        self.progress
            .mark_started(&id, &worker.id, None, self.workflow.as_ref(), self.observability.as_ref(), self.publisher.as_ref())
            .await;

        info!(work_item_id = %id, worker_id = %worker.id, ?role, "dispatching");

        let this = Arc::clone(self);
        let retry_count = queue_item.retry_count;
        tokio::spawn(async move {
            let result = this.executor.execute(ctx).await;
            this.handle_executor_continuation(item, worker.id, retry_count, result).await;
        });
    }

    async fn run_pre_execution_hooks(&self, ctx: &ExecutionContext) -> bool {
        let hooks = self.pre_hooks.read().unwrap().clone();
        for hook in hooks {
            match hook.check(ctx).await {
                Ok(true) => continue,
                Ok(false) => return false,
                Err(err) => {
                    warn!(error = %err, "pre-execution hook errored; treating as block");
                    return false;
                }
            }
        }
        true
    }

    /// Post-execution hooks observe a success; a panicking hook must not
    /// unwind into the caller, since that caller is the executor
    /// continuation and `self.ledger.register_complete` (driver.rs below)
    /// still has to run after this returns (spec.md §4.4/§4.6: a hook's
    /// exception is logged and does not abort the chain).
    async fn run_post_execution_hooks(&self, ctx: &ExecutionContext, result: &crate::interfaces::ExecutionResult) {
        let hooks = self.post_hooks.read().unwrap().clone();
        for hook in hooks {
            let outcome = AssertUnwindSafe(hook.run(ctx, result)).catch_unwind().await;
            if outcome.is_err() {
                warn!(work_item_id = %ctx.item.id, "post-execution hook panicked");
            }
        }
    }

    async fn run_error_hooks(&self, ctx: &ExecutionContext, error: &str) {
        let hooks = self.error_hooks.read().unwrap().clone();
        for hook in hooks {
            let outcome = AssertUnwindSafe(hook.run(ctx, error)).catch_unwind().await;
            if outcome.is_err() {
                warn!(work_item_id = %ctx.item.id, "error hook panicked");
            }
        }
    }

    async fn maybe_auto_spawn(&self) {
        let (auto_spawn, template_id) = {
            let config = self.config.read().unwrap();
            (config.auto_spawn_workers, config.default_template_id.clone())
        };
        let Some(template_id) = template_id.filter(|_| auto_spawn) else {
            return;
        };
        match self.pool.can_spawn_more().await {
            Ok(true) => {
                if let Err(err) = self.pool.spawn(&template_id, &uuid_like_session_id()).await {
                    error!(error = %err, "auto-spawn failed");
                }
            }
            Ok(false) => {}
            Err(err) => error!(error = %err, "can_spawn_more check failed"),
        }
    }

    async fn handle_executor_continuation(
        self: Arc<Self>,
        item: WorkItem,
        worker_id: crate::types::WorkerId,
        retry_count: u32,
        result: anyhow::Result<crate::interfaces::ExecutionResult>,
    ) {
        let id = item.id.clone();
        let ctx = ExecutionContext {
            item: item.clone(),
            worker_id: worker_id.clone(),
            role: self.scorer.determine_role(&item),
        };

        match result {
            Ok(r) if r.status == ExecutionStatus::Success => {
                self.progress
                    .mark_completed(&id, &worker_id, self.workflow.as_ref(), self.observability.as_ref(), self.publisher.as_ref())
                    .await;
                if let Err(err) = self.workflow.complete_work(&id, &worker_id).await {
                    error!(work_item_id = %id, error = %err, "workflow complete_work failed");
                }
                self.run_post_execution_hooks(&ctx, &r).await;
                if let Some(repo_id) = &item.repository_id {
                    self.scorer.record_repo_experience(&worker_id, repo_id, Utc::now());
                }
                self.retries.clear_error_history(&id);
                self.queue.complete(&id);
            }
            Ok(r) if r.status == ExecutionStatus::Cancelled => {
                self.queue.complete(&id);
            }
            Ok(r) => {
                let message = r.error.unwrap_or_else(|| "executor reported an error with no message".to_string());
                self.handle_executor_error(item.clone(), worker_id.clone(), retry_count, message, None)
                    .await;
            }
            Err(err) => {
                self.handle_executor_error(item.clone(), worker_id.clone(), retry_count, err.to_string(), None)
                    .await;
            }
        }

        self.ledger.register_complete(&item, &worker_id);
    }

    /// Error handler continuation (spec.md §4.6): categorize, record,
    /// notify, then retry-or-escalate.
    async fn handle_executor_error(
        self: &Arc<Self>,
        item: WorkItem,
        worker_id: crate::types::WorkerId,
        retry_count: u32,
        message: String,
        forced_category: Option<crate::error::ErrorCategory>,
    ) {
        let id = item.id.clone();
        let category = forced_category.unwrap_or_else(|| self.retries.categorize(&message));
        self.retries.record_error(&id, category, &message, &worker_id);

        self.retries.log(LogEntry {
            level: LogLevel::Error,
            timestamp: Utc::now(),
            work_item_id: Some(id.clone()),
            category: Some(category),
            message: message.clone(),
            retry_count: Some(retry_count),
            will_retry: None,
        });

        self.progress
            .mark_failed(&id, &worker_id, message.clone(), self.workflow.as_ref(), self.observability.as_ref(), self.publisher.as_ref())
            .await;

        let ctx = ExecutionContext {
            item: item.clone(),
            worker_id: worker_id.clone(),
            role: self.scorer.determine_role(&item),
        };
        self.run_error_hooks(&ctx, &message).await;

        if let Some(retry_ctx) = self.retries.schedule_retry_as(&id, &message, retry_count, category) {
            info!(work_item_id = %id, next_retry_at = %retry_ctx.next_retry_at, "retry scheduled");
        } else {
            let event = self.retries.escalate(&id, &worker_id, &message, category);
            warn!(work_item_id = %id, reason = %event.reason, "escalated");
            if let Err(err) = self.workflow.transition(&id, crate::types::WorkItemStatus::Backlog).await {
                error!(work_item_id = %id, error = %err, "transition to backlog failed");
            }
        }

        self.queue.complete(&id);
        if let Err(err) = self.pool.report_error(&worker_id, &message).await {
            error!(worker_id = %worker_id, error = %err, "failed to report error to worker pool");
        }
    }
}

fn uuid_like_session_id() -> String {
    format!("session-{}-{}", fastrand::u64(..), fastrand::u64(..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::ExecutionResult;
    use crate::testing::*;
    use crate::types::{Capability, Role as RoleT, Template, WorkItem, WorkItemId, WorkItemStatus, WorkItemType, Worker, WorkerId, WorkerStatus};

    fn bug(id: &str, repo: Option<&str>) -> WorkItem {
        WorkItem {
            id: WorkItemId::from(id),
            item_type: WorkItemType::Bug,
            status: WorkItemStatus::Ready,
            repository_id: repo.map(|s| s.to_string()),
            creator_id: "u1".into(),
            created_at: Utc::now(),
            success_criteria: vec![],
            linked_files: vec![],
            blocked_by: vec![],
            child_ids: vec![],
            started_at: None,
            completed_at: None,
        }
    }

    fn wildcard_worker(id: &str) -> Worker {
        Worker {
            id: WorkerId::from(id),
            template: Template {
                id: "tmpl".into(),
                allowed_types: Capability::Wildcard,
                default_role: None,
            },
            status: WorkerStatus::Idle,
            context_used: 0,
            context_limit: 100_000,
            tokens_used: 0,
            cost_usd: 0.0,
            tool_call_count: 0,
            error_count: 0,
            current_assignment: None,
        }
    }

    fn build_driver() -> (
        Arc<DriverLoop>,
        Arc<FakeWorkStore>,
        Arc<FakeWorkerPool>,
        Arc<FakeWorkflow>,
        Arc<FakeExecutor>,
    ) {
        let store = Arc::new(FakeWorkStore::new());
        let pool = Arc::new(FakeWorkerPool::new());
        let workflow = Arc::new(FakeWorkflow::new());
        let executor = Arc::new(FakeExecutor::new());
        let observability = Arc::new(FakeObservabilitySink::new());
        let publisher = Arc::new(FakeProgressPublisher::new());

        let driver = DriverLoop::new(
            OrchestratorConfig::default(),
            Collaborators {
                store: store.clone(),
                pool: pool.clone(),
                workflow: workflow.clone(),
                executor: executor.clone(),
                observability,
                publisher,
            },
        );
        (driver, store, pool, workflow, executor)
    }

    #[tokio::test]
    async fn happy_dispatch_assigns_and_starts_progress() {
        let (driver, store, pool, workflow, executor) = build_driver();
        store.seed(bug("w1", None));
        pool.seed(wildcard_worker("a1"));
        executor.push_result(ExecutionResult {
            execution_id: "e1".into(),
            status: ExecutionStatus::Success,
            error: None,
            tokens_used: 10,
            cost_usd: 0.0001,
            tool_calls_count: 1,
        });

        driver.force_cycle().await;
        // allow the fire-and-continue executor task to run
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(driver.ledger().status().global_count, 0);
        assert_eq!(driver.queue().length(), 0);
        assert_eq!(
            workflow.assignments(),
            vec![(WorkItemId::from("w1"), WorkerId::from("a1"), RoleT::Implementer)]
        );
    }

    #[tokio::test]
    async fn blocked_item_is_held_out_of_the_queue() {
        let (driver, store, pool, workflow, _executor) = build_driver();
        let mut blocked = bug("w1", None);
        blocked.blocked_by = vec![WorkItemId::from("w0")];
        store.seed(blocked);
        let mut blocker = bug("w0", None);
        blocker.status = WorkItemStatus::InProgress;
        store.seed(blocker);
        pool.seed(wildcard_worker("a1"));

        driver.force_cycle().await;

        assert_eq!(driver.queue().length(), 0);
        assert_eq!(driver.queue().processing_count(), 0);
        assert!(workflow.assignments().is_empty());
    }

    #[tokio::test]
    async fn per_repo_cap_requeues_the_excess_item() {
        let (driver, store, pool, _workflow, executor) = build_driver();
        driver.update_config(PartialOrchestratorConfig {
            max_workers_per_repo: Some(2),
            ..Default::default()
        });
        for i in 0..3 {
            store.seed(bug(&format!("w{i}"), Some("R")));
            pool.seed(wildcard_worker(&format!("a{i}")));
        }
        for _ in 0..3 {
            executor.push_result(ExecutionResult {
                execution_id: "e".into(),
                status: ExecutionStatus::Success,
                error: None,
                tokens_used: 0,
                cost_usd: 0.0,
                tool_calls_count: 0,
            });
        }

        driver.force_cycle().await;

        assert_eq!(driver.queue().processing_count(), 2);
        assert_eq!(driver.queue().length(), 1);
        let snapshot = driver.queue().snapshot();
        assert!(snapshot[0].last_error.as_ref().unwrap().contains("Per-repository limit"));
    }
}
