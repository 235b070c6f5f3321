//! Concurrency ledger (spec.md §4.5).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::types::{WorkItem, WorkerId};

/// Outcome of a `mayStart` check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl StartDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Observational snapshot of ledger occupancy.
#[derive(Debug, Clone)]
pub struct LedgerStatus {
    pub global_count: usize,
    pub repo_counts: HashMap<String, usize>,
    pub user_counts: HashMap<String, usize>,
}

struct State {
    global: HashSet<WorkerId>,
    by_repo: HashMap<String, HashSet<WorkerId>>,
    by_user: HashMap<String, HashSet<WorkerId>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            global: HashSet::new(),
            by_repo: HashMap::new(),
            by_user: HashMap::new(),
        }
    }
}

/// The concurrency ledger component: global, per-repo, and per-user caps.
pub struct ConcurrencyLedger {
    state: Mutex<State>,
    max_global: Mutex<u32>,
    max_per_repo: Mutex<u32>,
    max_per_user: Mutex<u32>,
}

impl ConcurrencyLedger {
    pub fn new(max_global: u32, max_per_repo: u32, max_per_user: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_global: Mutex::new(max_global),
            max_per_repo: Mutex::new(max_per_repo),
            max_per_user: Mutex::new(max_per_user),
        }
    }

    /// Checks global, then per-repo, then per-user occupancy in that order,
    /// returning the first violated cap as `reason`.
    pub fn may_start(&self, item: &WorkItem) -> StartDecision {
        let state = self.state.lock().unwrap();
        let max_global = *self.max_global.lock().unwrap();
        let max_per_repo = *self.max_per_repo.lock().unwrap();
        let max_per_user = *self.max_per_user.lock().unwrap();

        if state.global.len() as u32 >= max_global {
            return StartDecision::deny(format!(
                "Global concurrency limit reached ({} of {})",
                state.global.len(),
                max_global
            ));
        }

        if let Some(repo_id) = &item.repository_id {
            let count = state.by_repo.get(repo_id).map(|s| s.len()).unwrap_or(0);
            if count as u32 >= max_per_repo {
                return StartDecision::deny(format!(
                    "Per-repository limit reached for {} ({} of {})",
                    repo_id, count, max_per_repo
                ));
            }
        }

        let user_count = state.by_user.get(&item.creator_id).map(|s| s.len()).unwrap_or(0);
        if user_count as u32 >= max_per_user {
            return StartDecision::deny(format!(
                "Per-user limit reached for {} ({} of {})",
                item.creator_id, user_count, max_per_user
            ));
        }

        StartDecision::allow()
    }

    /// Registers `worker_id` as occupying a slot for `item`. Must be paired
    /// with [`Self::register_complete`] on every exit path.
    pub fn register_start(&self, item: &WorkItem, worker_id: &WorkerId) {
        let mut state = self.state.lock().unwrap();
        state.global.insert(worker_id.clone());
        if let Some(repo_id) = &item.repository_id {
            state.by_repo.entry(repo_id.clone()).or_default().insert(worker_id.clone());
        }
        state
            .by_user
            .entry(item.creator_id.clone())
            .or_default()
            .insert(worker_id.clone());
    }

    /// Releases the slot `worker_id` held for `item`. Empty repo/user
    /// buckets are removed to keep the indices compact.
    pub fn register_complete(&self, item: &WorkItem, worker_id: &WorkerId) {
        let mut state = self.state.lock().unwrap();
        state.global.remove(worker_id);
        if let Some(repo_id) = &item.repository_id {
            if let Some(bucket) = state.by_repo.get_mut(repo_id) {
                bucket.remove(worker_id);
                if bucket.is_empty() {
                    state.by_repo.remove(repo_id);
                }
            }
        }
        if let Some(bucket) = state.by_user.get_mut(&item.creator_id) {
            bucket.remove(worker_id);
            if bucket.is_empty() {
                state.by_user.remove(&item.creator_id);
            }
        }
    }

    pub fn status(&self) -> LedgerStatus {
        let state = self.state.lock().unwrap();
        LedgerStatus {
            global_count: state.global.len(),
            repo_counts: state.by_repo.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
            user_counts: state.by_user.iter().map(|(k, v)| (k.clone(), v.len())).collect(),
        }
    }

    /// Atomically replaces any subset of the three caps. In-flight counts
    /// are unaffected; subsequent `may_start` checks honour the new limits.
    pub fn update_limits(&self, max_global: Option<u32>, max_per_repo: Option<u32>, max_per_user: Option<u32>) {
        if let Some(v) = max_global {
            *self.max_global.lock().unwrap() = v;
        }
        if let Some(v) = max_per_repo {
            *self.max_per_repo.lock().unwrap() = v;
        }
        if let Some(v) = max_per_user {
            *self.max_per_user.lock().unwrap() = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WorkItemId, WorkItemStatus, WorkItemType};
    use chrono::Utc;

    fn item(id: &str, repo: Option<&str>, creator: &str) -> WorkItem {
        WorkItem {
            id: WorkItemId::from(id),
            item_type: WorkItemType::Bug,
            status: WorkItemStatus::Ready,
            repository_id: repo.map(|s| s.to_string()),
            creator_id: creator.into(),
            created_at: Utc::now(),
            success_criteria: vec![],
            linked_files: vec![],
            blocked_by: vec![],
            child_ids: vec![],
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn register_start_then_complete_restores_prior_state() {
        let ledger = ConcurrencyLedger::new(10, 3, 5);
        let it = item("w1", Some("R"), "u1");
        let worker = WorkerId::from("a1");

        let before = ledger.status().global_count;
        ledger.register_start(&it, &worker);
        ledger.register_complete(&it, &worker);
        let after = ledger.status().global_count;

        assert_eq!(before, after);
        assert!(!ledger.status().repo_counts.contains_key("R"));
    }

    #[test]
    fn per_repo_cap_produces_reason_containing_expected_phrase() {
        let ledger = ConcurrencyLedger::new(10, 2, 10);
        let repo_item = |id: &str| item(id, Some("R"), "u1");

        ledger.register_start(&repo_item("w1"), &WorkerId::from("a1"));
        ledger.register_start(&repo_item("w2"), &WorkerId::from("a2"));

        let decision = ledger.may_start(&repo_item("w3"));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("Per-repository limit"));
    }

    #[test]
    fn global_cap_checked_before_repo_cap() {
        let ledger = ConcurrencyLedger::new(1, 10, 10);
        ledger.register_start(&item("w1", None, "u1"), &WorkerId::from("a1"));
        let decision = ledger.may_start(&item("w2", None, "u2"));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("Global"));
    }
}
