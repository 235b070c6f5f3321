//! Priority work queue (spec.md §4.1).
//!
//! Pure in-memory; `refresh` is the only fallible operation, since it must
//! consult the external Work Store.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::interfaces::WorkStore;
use crate::types::{WorkItem, WorkItemId, WorkItemStatus};

/// Cap on the age-hours term of the priority formula.
const AGE_BONUS_CAP_HOURS: i64 = 48;

/// An in-memory queue entry: a work-item snapshot plus scheduling metadata.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub item: WorkItem,
    pub priority: i64,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Monotonic insertion sequence, used to break priority ties by
    /// insertion order (spec.md §4.1 `next`).
    seq: u64,
}

/// Computes the priority formula from spec.md §4.1: type weight + capped age
/// bonus + dependents bonus.
pub fn compute_priority(item: &WorkItem, now: DateTime<Utc>) -> i64 {
    let type_weight = item.item_type.priority_weight();
    let age_bonus = item.age_hours(now).min(AGE_BONUS_CAP_HOURS);
    let dependents_bonus = 5 * item.child_ids.len() as i64;
    type_weight + age_bonus + dependents_bonus
}

#[derive(Default)]
struct State {
    queued: HashMap<WorkItemId, QueueItem>,
    processing: HashMap<WorkItemId, QueueItem>,
    next_seq: u64,
}

/// The priority queue component. Internally synchronized with a single
/// coarse lock (spec.md §9).
pub struct PriorityQueue {
    state: Mutex<State>,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Fetches ready items from the store, filters those blocked by
    /// unresolved dependencies or already in flight, and inserts the rest
    /// with a freshly computed priority.
    pub async fn refresh(&self, store: &dyn WorkStore) -> anyhow::Result<()> {
        let ready = store.find_by_status(WorkItemStatus::Ready).await?;
        let now = Utc::now();

        for item in ready {
            if self.contains_anywhere(&item.id) {
                continue;
            }
            if !item.blocked_by.is_empty() {
                let blockers = store.find_by_ids(&item.blocked_by).await?;
                let all_done = blockers.len() == item.blocked_by.len()
                    && blockers.iter().all(|b| b.status == WorkItemStatus::Done);
                if !all_done {
                    debug!(work_item_id = %item.id, "skipping blocked item");
                    continue;
                }
            }
            let priority = compute_priority(&item, now);
            self.insert(item, priority, now);
        }
        Ok(())
    }

    fn contains_anywhere(&self, id: &WorkItemId) -> bool {
        let state = self.state.lock().unwrap();
        state.queued.contains_key(id) || state.processing.contains_key(id)
    }

    fn insert(&self, item: WorkItem, priority: i64, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = item.id.clone();
        state.queued.insert(
            id,
            QueueItem {
                item,
                priority,
                queued_at: now,
                retry_count: 0,
                last_error: None,
                last_attempt_at: None,
                seq,
            },
        );
    }

    /// Inserts (or overwrites) a queue item directly — used by the driver
    /// loop to promote a ready retry back into the queue (spec.md §4.6 step
    /// 2), preserving the retry's count and assigning the fixed priority 50.
    pub fn push_retry(&self, item: WorkItem, retry_count: u32) {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        let id = item.id.clone();
        state.queued.insert(
            id,
            QueueItem {
                item,
                priority: 50,
                queued_at: Utc::now(),
                retry_count,
                last_error: None,
                last_attempt_at: None,
                seq,
            },
        );
    }

    /// Returns and moves the highest-priority item into the processing set.
    /// Ties break by insertion order.
    pub fn next(&self) -> Option<QueueItem> {
        let mut state = self.state.lock().unwrap();
        let best_id = state
            .queued
            .values()
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|q| q.item.id.clone())?;
        let entry = state.queued.remove(&best_id)?;
        state.processing.insert(best_id, entry.clone());
        Some(entry)
    }

    /// Removes `id` from processing and reinserts with a reduced priority,
    /// incremented retry count, and updated error/attempt metadata.
    pub fn requeue(&self, id: &WorkItemId, error_message: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        let Some(mut entry) = state.processing.remove(id) else {
            return;
        };
        entry.retry_count += 1;
        entry.priority -= 10 * entry.retry_count as i64;
        entry.last_error = Some(error_message.into());
        entry.last_attempt_at = Some(Utc::now());
        state.queued.insert(id.clone(), entry);
    }

    /// Removes `id` from processing without reinsertion.
    pub fn complete(&self, id: &WorkItemId) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(id);
    }

    /// Removes `id` from both sets.
    pub fn remove(&self, id: &WorkItemId) {
        let mut state = self.state.lock().unwrap();
        state.queued.remove(id);
        state.processing.remove(id);
    }

    pub fn length(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }

    pub fn processing_count(&self) -> usize {
        self.state.lock().unwrap().processing.len()
    }

    pub fn contains(&self, id: &WorkItemId) -> bool {
        self.contains_anywhere(id)
    }

    /// A snapshot of every queued item, for diagnostics.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.state.lock().unwrap().queued.values().cloned().collect()
    }
}
