//! Progress tracker (spec.md §4.3).
//!
//! Listener/hook dispatch follows the reference coordination layer's
//! `catch_unwind`-guarded callback chain (`seesaw/machine.rs`): a panicking
//! listener is logged and does not prevent later listeners from running.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::interfaces::{ObservabilitySink, ProgressPublisher, Workflow};
use crate::types::{WorkItemId, WorkItemPatch, WorkItemStatus, WorkerId};

/// Status carried by a single progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Milestone,
    Blocked,
    Completed,
    Failed,
}

/// A single progress event (spec.md §4.3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProgressEvent {
    pub work_item_id: WorkItemId,
    pub worker_id: WorkerId,
    pub execution_id: Option<String>,
    pub status: ProgressStatus,
    pub message: Option<String>,
    pub progress: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

type Listener = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Default)]
struct State {
    history: HashMap<WorkItemId, Vec<ProgressEvent>>,
    listeners: Vec<Listener>,
}

/// The progress tracker component.
pub struct ProgressTracker {
    state: Mutex<State>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.state.lock().unwrap().listeners.push(Box::new(listener));
    }

    async fn record(
        &self,
        event: ProgressEvent,
        workflow: &dyn Workflow,
        observability: &dyn ObservabilitySink,
        publisher: &dyn ProgressPublisher,
    ) {
        let patch = self.transition_for(&event);

        {
            let mut state = self.state.lock().unwrap();
            state
                .history
                .entry(event.work_item_id.clone())
                .or_default()
                .push(event.clone());
            if event.status == ProgressStatus::Completed {
                state.history.remove(&event.work_item_id);
            }
        }

        if let Some(status) = patch.as_ref().and_then(|p| p.status) {
            if let Err(err) = workflow.transition(&event.work_item_id, status).await {
                warn!(work_item_id = %event.work_item_id, error = %err, "progress-driven transition failed");
            }
        }

        observability
            .record_update(&event.work_item_id, &patch.unwrap_or_default())
            .await;
        self.dispatch_listeners(&event);
        self.publish_best_effort(publisher, &event);
    }

    fn transition_for(&self, event: &ProgressEvent) -> Option<WorkItemPatch> {
        match event.status {
            ProgressStatus::Started => Some(WorkItemPatch {
                status: Some(WorkItemStatus::InProgress),
                started_at: Some(event.timestamp),
                updated_at: Some(event.timestamp),
                ..Default::default()
            }),
            ProgressStatus::Completed => Some(WorkItemPatch {
                status: Some(WorkItemStatus::Review),
                completed_at: Some(event.timestamp),
                updated_at: Some(event.timestamp),
                ..Default::default()
            }),
            ProgressStatus::Failed | ProgressStatus::Blocked | ProgressStatus::InProgress | ProgressStatus::Milestone => {
                Some(WorkItemPatch {
                    updated_at: Some(event.timestamp),
                    ..Default::default()
                })
            }
        }
    }

    fn dispatch_listeners(&self, event: &ProgressEvent) {
        let listeners_count = {
            let state = self.state.lock().unwrap();
            state.listeners.len()
        };
        for i in 0..listeners_count {
            let result = {
                let state = self.state.lock().unwrap();
                let listener = &state.listeners[i];
                catch_unwind(AssertUnwindSafe(|| listener(event)))
            };
            if result.is_err() {
                warn!(work_item_id = %event.work_item_id, "progress listener panicked");
            }
        }
    }

    fn publish_best_effort(&self, publisher: &dyn ProgressPublisher, event: &ProgressEvent) {
        let result = catch_unwind(AssertUnwindSafe(|| publisher.publish(event)));
        if result.is_err() {
            warn!(work_item_id = %event.work_item_id, "progress publisher panicked");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_started(
        &self,
        item_id: &WorkItemId,
        worker_id: &WorkerId,
        execution_id: Option<String>,
        workflow: &dyn Workflow,
        observability: &dyn ObservabilitySink,
        publisher: &dyn ProgressPublisher,
    ) {
        debug!(work_item_id = %item_id, worker_id = %worker_id, "marking started");
        self.record(
            ProgressEvent {
                work_item_id: item_id.clone(),
                worker_id: worker_id.clone(),
                execution_id,
                status: ProgressStatus::Started,
                message: None,
                progress: None,
                timestamp: Utc::now(),
            },
            workflow,
            observability,
            publisher,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_progress(
        &self,
        item_id: &WorkItemId,
        worker_id: &WorkerId,
        progress: u8,
        message: Option<String>,
        workflow: &dyn Workflow,
        observability: &dyn ObservabilitySink,
        publisher: &dyn ProgressPublisher,
    ) {
        let clamped = progress.min(99);
        self.record(
            ProgressEvent {
                work_item_id: item_id.clone(),
                worker_id: worker_id.clone(),
                execution_id: None,
                status: ProgressStatus::InProgress,
                message,
                progress: Some(clamped),
                timestamp: Utc::now(),
            },
            workflow,
            observability,
            publisher,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_completed(
        &self,
        item_id: &WorkItemId,
        worker_id: &WorkerId,
        workflow: &dyn Workflow,
        observability: &dyn ObservabilitySink,
        publisher: &dyn ProgressPublisher,
    ) {
        self.record(
            ProgressEvent {
                work_item_id: item_id.clone(),
                worker_id: worker_id.clone(),
                execution_id: None,
                status: ProgressStatus::Completed,
                message: None,
                progress: Some(100),
                timestamp: Utc::now(),
            },
            workflow,
            observability,
            publisher,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_failed(
        &self,
        item_id: &WorkItemId,
        worker_id: &WorkerId,
        message: impl Into<String>,
        workflow: &dyn Workflow,
        observability: &dyn ObservabilitySink,
        publisher: &dyn ProgressPublisher,
    ) {
        self.record(
            ProgressEvent {
                work_item_id: item_id.clone(),
                worker_id: worker_id.clone(),
                execution_id: None,
                status: ProgressStatus::Failed,
                message: Some(message.into()),
                progress: None,
                timestamp: Utc::now(),
            },
            workflow,
            observability,
            publisher,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_blocked(
        &self,
        item_id: &WorkItemId,
        worker_id: &WorkerId,
        message: impl Into<String>,
        workflow: &dyn Workflow,
        observability: &dyn ObservabilitySink,
        publisher: &dyn ProgressPublisher,
    ) {
        self.record(
            ProgressEvent {
                work_item_id: item_id.clone(),
                worker_id: worker_id.clone(),
                execution_id: None,
                status: ProgressStatus::Blocked,
                message: Some(message.into()),
                progress: None,
                timestamp: Utc::now(),
            },
            workflow,
            observability,
            publisher,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_milestone(
        &self,
        item_id: &WorkItemId,
        worker_id: &WorkerId,
        message: impl Into<String>,
        workflow: &dyn Workflow,
        observability: &dyn ObservabilitySink,
        publisher: &dyn ProgressPublisher,
    ) {
        self.record(
            ProgressEvent {
                work_item_id: item_id.clone(),
                worker_id: worker_id.clone(),
                execution_id: None,
                status: ProgressStatus::Milestone,
                message: Some(message.into()),
                progress: None,
                timestamp: Utc::now(),
            },
            workflow,
            observability,
            publisher,
        )
        .await;
    }

    /// Full event history recorded for a work item, in append order.
    pub fn history(&self, item_id: &WorkItemId) -> Vec<ProgressEvent> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(item_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The most recent event recorded for a work item, if any.
    pub fn current(&self, item_id: &WorkItemId) -> Option<ProgressEvent> {
        self.state.lock().unwrap().history.get(item_id)?.last().cloned()
    }

    /// Ids with a non-empty history (i.e. started but not yet completed).
    pub fn in_progress(&self) -> Vec<WorkItemId> {
        self.state.lock().unwrap().history.keys().cloned().collect()
    }

    /// Drops all recorded history (used by tests and manual resets).
    pub fn clear(&self, item_id: &WorkItemId) {
        self.state.lock().unwrap().history.remove(item_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeObservabilitySink, FakeProgressPublisher, FakeWorkflow};

    #[tokio::test]
    async fn started_sets_in_progress_and_records_history() {
        let tracker = ProgressTracker::new();
        let workflow = FakeWorkflow::new();
        let obs = FakeObservabilitySink::new();
        let publisher = FakeProgressPublisher::new();
        let id = WorkItemId::from("w1");
        let worker = WorkerId::from("a1");

        tracker.mark_started(&id, &worker, None, &workflow, &obs, &publisher).await;

        let history = tracker.history(&id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ProgressStatus::Started);
        assert_eq!(workflow.transitions_for(&id), vec![WorkItemStatus::InProgress]);
    }

    #[tokio::test]
    async fn completed_clears_history_and_transitions_to_review() {
        let tracker = ProgressTracker::new();
        let workflow = FakeWorkflow::new();
        let obs = FakeObservabilitySink::new();
        let publisher = FakeProgressPublisher::new();
        let id = WorkItemId::from("w1");
        let worker = WorkerId::from("a1");

        tracker.mark_started(&id, &worker, None, &workflow, &obs, &publisher).await;
        tracker.mark_completed(&id, &worker, &workflow, &obs, &publisher).await;

        assert!(tracker.history(&id).is_empty());
        assert_eq!(
            workflow.transitions_for(&id),
            vec![WorkItemStatus::InProgress, WorkItemStatus::Review]
        );
    }

    #[tokio::test]
    async fn progress_is_clamped_to_99() {
        let tracker = ProgressTracker::new();
        let workflow = FakeWorkflow::new();
        let obs = FakeObservabilitySink::new();
        let publisher = FakeProgressPublisher::new();
        let id = WorkItemId::from("w1");
        let worker = WorkerId::from("a1");

        tracker
            .update_progress(&id, &worker, 150, None, &workflow, &obs, &publisher)
            .await;

        assert_eq!(tracker.current(&id).unwrap().progress, Some(99));
    }

    #[tokio::test]
    async fn a_panicking_listener_does_not_stop_later_listeners() {
        let tracker = ProgressTracker::new();
        let workflow = FakeWorkflow::new();
        let obs = FakeObservabilitySink::new();
        let publisher = FakeProgressPublisher::new();
        let id = WorkItemId::from("w1");
        let worker = WorkerId::from("a1");

        let second_ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let second_ran_clone = second_ran.clone();

        tracker.add_listener(|_event| panic!("boom"));
        tracker.add_listener(move |_event| {
            second_ran_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        tracker.mark_started(&id, &worker, None, &workflow, &obs, &publisher).await;

        assert!(second_ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
