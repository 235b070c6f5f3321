//! Cross-component scheduling scenarios, driven end-to-end through
//! [`orchestrator_core::DriverLoop`] against the crate's in-memory fakes.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use orchestrator_core::interfaces::{ExecutionResult, ExecutionStatus};
use orchestrator_core::testing::{
    FakeExecutor, FakeObservabilitySink, FakeProgressPublisher, FakeWorkStore, FakeWorkerPool, FakeWorkflow,
};
use orchestrator_core::{
    Capability, Collaborators, DriverLoop, OrchestratorConfig, PartialOrchestratorConfig, Template, WorkItem,
    WorkItemId, WorkItemStatus, WorkItemType, Worker, WorkerId, WorkerStatus,
};

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

struct Harness {
    driver: Arc<DriverLoop>,
    store: Arc<FakeWorkStore>,
    pool: Arc<FakeWorkerPool>,
    workflow: Arc<FakeWorkflow>,
    executor: Arc<FakeExecutor>,
}

fn harness(config: OrchestratorConfig) -> Harness {
    let store = Arc::new(FakeWorkStore::new());
    let pool = Arc::new(FakeWorkerPool::new());
    let workflow = Arc::new(FakeWorkflow::linked_to(store.clone()));
    let executor = Arc::new(FakeExecutor::new());
    let observability = Arc::new(FakeObservabilitySink::new());
    let publisher = Arc::new(FakeProgressPublisher::new());

    let driver = DriverLoop::new(
        config,
        Collaborators {
            store: store.clone(),
            pool: pool.clone(),
            workflow: workflow.clone(),
            executor: executor.clone(),
            observability,
            publisher,
        },
    );

    Harness {
        driver,
        store,
        pool,
        workflow,
        executor,
    }
}

/// spec.md §8 scenario 3: a transient executor failure is retried, and once
/// the scheduled delay elapses the item is dispatched again.
#[tokio::test]
async fn transient_failure_is_retried_after_backoff_elapses() {
    let mut config = OrchestratorConfig::default();
    config.retry_base_delay_ms = 20;
    config.retry_max_delay_ms = 100;
    let h = harness(config);

    h.store.seed(bug("w1", None));
    h.pool.seed(wildcard_worker("a1"));
    h.executor.push_error(anyhow::anyhow!("Connection timeout"));
    h.executor.push_result(ExecutionResult {
        execution_id: "e2".into(),
        status: ExecutionStatus::Success,
        error: None,
        tokens_used: 5,
        cost_usd: 0.0,
        tool_calls_count: 1,
    });

    h.driver.force_cycle().await;
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    assert_eq!(h.driver.retries().stats().pending_retries, 1);
    assert_eq!(h.executor.call_count(), 1);

    // Wait past the jittered backoff window (base 20ms, ceiling 1.2x) before
    // the retry is actually due.
    tokio::time::sleep(StdDuration::from_millis(150)).await;

    h.driver.force_cycle().await;
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    assert_eq!(h.executor.call_count(), 2);
    assert_eq!(h.driver.queue().length(), 0);
    assert_eq!(h.driver.queue().processing_count(), 0);
}

/// spec.md §8 scenario 4: a persistently failing executor exhausts its
/// retries and the item is escalated back to backlog.
#[tokio::test]
async fn persistent_failure_escalates_to_backlog() {
    let mut config = OrchestratorConfig::default();
    config.retry_base_delay_ms = 5;
    config.retry_max_delay_ms = 20;
    let h = harness(config);

    h.store.seed(bug("w1", None));
    h.pool.seed(wildcard_worker("a1"));
    for _ in 0..10 {
        h.executor.push_error(anyhow::anyhow!("503 Service Unavailable"));
    }

    // Initial attempt + up to 3 transient retries = 4 terminal errors.
    for _ in 0..4 {
        h.driver.force_cycle().await;
        tokio::time::sleep(StdDuration::from_millis(60)).await;
    }

    let history = h.driver.retries().error_history(&WorkItemId::from("w1")).unwrap();
    assert!(history.escalated);
    assert_eq!(history.total_failures, 4);
    assert_eq!(
        h.workflow.transitions_for(&WorkItemId::from("w1")).last(),
        Some(&WorkItemStatus::Backlog)
    );
}

/// spec.md §8 scenario 5: the per-repository cap requeues the excess item
/// while letting the rest proceed, preserving fairness across repos.
#[tokio::test]
async fn per_repo_cap_lets_other_repos_proceed() {
    let mut config = OrchestratorConfig::default();
    config.max_workers_per_repo = 1;
    let h = harness(config);

    h.store.seed(bug("r-a", Some("R")));
    h.store.seed(bug("r-b", Some("R")));
    h.store.seed(bug("s-a", Some("S")));
    h.pool.seed(wildcard_worker("a1"));
    h.pool.seed(wildcard_worker("a2"));
    h.pool.seed(wildcard_worker("a3"));
    for _ in 0..3 {
        h.executor.push_result(ExecutionResult {
            execution_id: "e".into(),
            status: ExecutionStatus::Success,
            error: None,
            tokens_used: 0,
            cost_usd: 0.0,
            tool_calls_count: 0,
        });
    }

    h.driver.force_cycle().await;

    assert_eq!(h.driver.queue().processing_count(), 2);
    assert_eq!(h.driver.queue().length(), 1);
    let remaining = h.driver.queue().snapshot();
    assert_eq!(remaining[0].item.repository_id.as_deref(), Some("R"));
}

/// spec.md §6: `updateConfig` only replaces fields present in the patch.
#[tokio::test]
async fn update_config_merges_partial_patch() {
    let h = harness(OrchestratorConfig::default());
    h.driver.update_config(PartialOrchestratorConfig {
        max_global_workers: Some(1),
        ..Default::default()
    });

    h.store.seed(bug("w1", None));
    h.store.seed(bug("w2", None));
    h.pool.seed(wildcard_worker("a1"));
    h.pool.seed(wildcard_worker("a2"));
    h.executor.push_result(ExecutionResult {
        execution_id: "e".into(),
        status: ExecutionStatus::Success,
        error: None,
        tokens_used: 0,
        cost_usd: 0.0,
        tool_calls_count: 0,
    });
    h.executor.push_result(ExecutionResult {
        execution_id: "e".into(),
        status: ExecutionStatus::Success,
        error: None,
        tokens_used: 0,
        cost_usd: 0.0,
        tool_calls_count: 0,
    });

    h.driver.force_cycle().await;

    assert_eq!(h.driver.queue().processing_count(), 1);
    assert_eq!(h.driver.queue().length(), 1);
    assert_eq!(h.driver.status().ledger_global_count, 1);
}
