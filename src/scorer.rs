//! Assignment scorer (spec.md §4.2).

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::config::ScoringWeights;
use crate::types::{Role, WorkItem, WorkItemStatus, Worker, WorkerId, WorkerStatus};

const COST_PER_TOKEN_THRESHOLD_USD: f64 = 0.00002;

/// Keyed by `(worker id, repository id)`. Read by the scorer, written by the
/// driver on successful completion (spec.md §3 Repo Familiarity Entry).
#[derive(Debug, Clone, Copy)]
struct FamiliarityEntry {
    completed_tasks: u32,
    last_worked_at: DateTime<Utc>,
}

/// The assignment scorer. The repo-familiarity cache is the only mutable
/// state it owns; it is process-wide and resets on restart (spec.md §9).
pub struct AssignmentScorer {
    weights: RwLock<ScoringWeights>,
    familiarity: DashMap<(WorkerId, String), FamiliarityEntry>,
}

impl AssignmentScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights: RwLock::new(weights),
            familiarity: DashMap::new(),
        }
    }

    pub fn set_weights(&self, weights: ScoringWeights) {
        *self.weights.write().unwrap() = weights;
    }

    /// Maps a work item's status to the role a worker should play on it.
    pub fn determine_role(&self, item: &WorkItem) -> Role {
        match item.status {
            WorkItemStatus::Backlog => Role::Refiner,
            WorkItemStatus::Ready => Role::Implementer,
            WorkItemStatus::InProgress => Role::Tester,
            WorkItemStatus::Review => Role::Reviewer,
            WorkItemStatus::Done => Role::Implementer,
        }
    }

    /// Picks the highest-scoring worker from `available` for `item` and
    /// `required_role`, or `None` if every candidate scores ≤ 0.
    pub fn find_best_worker<'a>(
        &self,
        item: &WorkItem,
        required_role: Role,
        available: &'a [Worker],
        now: DateTime<Utc>,
    ) -> Option<&'a Worker> {
        let mut scored: Vec<(&Worker, f64)> = available
            .iter()
            .map(|w| (w, self.score(item, required_role, w, now)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|(wa, sa), (wb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| wa.id.cmp(&wb.id))
        });

        scored.into_iter().next().map(|(w, _)| w)
    }

    /// Computes the score for a single (item, role, worker) triple per the
    /// seven-factor formula in spec.md §4.2. Public so hosts can expose
    /// "why was this worker chosen" diagnostics.
    pub fn score(&self, item: &WorkItem, required_role: Role, worker: &Worker, now: DateTime<Utc>) -> f64 {
        let w = self.weights.read().unwrap();
        let w = &*w;

        if !worker.template.allowed_types.allows(item.item_type) {
            return 0.0;
        }
        let mut score = 100.0 + 30.0 * w.capability_match;

        score += match worker.template.default_role {
            None => 15.0 * w.role_match,
            Some(default) if default == required_role => 25.0 * w.role_match,
            Some(_) => 5.0 * w.role_match,
        };

        if worker.status == WorkerStatus::Idle {
            score += 50.0 * w.workload;
        }

        score -= 10.0 * worker.error_count as f64 * w.error_history;

        if worker.context_limit > 0 {
            let used_ratio = worker.context_used as f64 / worker.context_limit as f64;
            score -= 30.0 * used_ratio * w.context_headroom;
        }

        if let Some(cost_per_token) = worker.cost_per_token() {
            if cost_per_token < COST_PER_TOKEN_THRESHOLD_USD {
                score += 10.0 * w.cost_efficiency;
            }
        }

        if let Some(repo_id) = &item.repository_id {
            score += self.repo_familiarity_bonus(&worker.id, repo_id, now) * w.repo_familiarity;
        }

        score.max(0.0)
    }

    fn repo_familiarity_bonus(&self, worker_id: &WorkerId, repo_id: &str, now: DateTime<Utc>) -> f64 {
        let Some(entry) = self.familiarity.get(&(worker_id.clone(), repo_id.to_string())) else {
            return 0.0;
        };
        let n = entry.completed_tasks.min(5) as f64;
        let hours_since = (now - entry.last_worked_at).num_hours();
        let recency = if hours_since < 24 {
            15.0
        } else if hours_since < 72 {
            10.0
        } else {
            5.0
        };
        5.0 * n + recency
    }

    /// Increments the (worker, repo) familiarity entry, creating one at
    /// count 1 if none exists, and stamps `last_worked_at` to now.
    pub fn record_repo_experience(&self, worker_id: &WorkerId, repo_id: &str, now: DateTime<Utc>) {
        self.familiarity
            .entry((worker_id.clone(), repo_id.to_string()))
            .and_modify(|e| {
                e.completed_tasks += 1;
                e.last_worked_at = now;
            })
            .or_insert(FamiliarityEntry {
                completed_tasks: 1,
                last_worked_at: now,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Capability, Template, WorkItemId, WorkItemType};
    use chrono::Duration;

    fn item(repo: Option<&str>) -> WorkItem {
        WorkItem {
            id: WorkItemId::from("w1"),
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

    fn worker(id: &str, allowed: Capability, status: WorkerStatus) -> Worker {
        Worker {
            id: WorkerId::from(id),
            template: Template {
                id: "tmpl".into(),
                allowed_types: allowed,
                default_role: None,
            },
            status,
            context_used: 0,
            context_limit: 100_000,
            tokens_used: 0,
            cost_usd: 0.0,
            tool_call_count: 0,
            error_count: 0,
            current_assignment: None,
        }
    }

    #[test]
    fn incapable_worker_scores_zero() {
        let scorer = AssignmentScorer::new(ScoringWeights::default());
        let it = item(None);
        let w = worker("a1", Capability::Types(vec![WorkItemType::Research]), WorkerStatus::Idle);
        assert_eq!(scorer.score(&it, Role::Implementer, &w, Utc::now()), 0.0);
    }

    #[test]
    fn wildcard_idle_worker_scores_positive() {
        let scorer = AssignmentScorer::new(ScoringWeights::default());
        let it = item(None);
        let w = worker("a1", Capability::Wildcard, WorkerStatus::Idle);
        assert!(scorer.score(&it, Role::Implementer, &w, Utc::now()) > 0.0);
    }

    #[test]
    fn familiar_worker_outscores_stranger() {
        let scorer = AssignmentScorer::new(ScoringWeights::default());
        let now = Utc::now();
        let it = item(Some("R"));
        let familiar = worker("x", Capability::Wildcard, WorkerStatus::Idle);
        let stranger = worker("y", Capability::Wildcard, WorkerStatus::Idle);
        scorer.record_repo_experience(&familiar.id, "R", now - Duration::minutes(30));
        // bump completed_tasks to 3 total
        scorer.record_repo_experience(&familiar.id, "R", now - Duration::minutes(20));
        scorer.record_repo_experience(&familiar.id, "R", now - Duration::minutes(10));

        let workers = vec![stranger, familiar];
        let best = scorer
            .find_best_worker(&it, Role::Implementer, &workers, now)
            .unwrap();
        assert_eq!(best.id, WorkerId::from("x"));
    }

    #[test]
    fn ties_break_by_lexicographic_worker_id() {
        let scorer = AssignmentScorer::new(ScoringWeights::default());
        let it = item(None);
        let workers = vec![
            worker("b", Capability::Wildcard, WorkerStatus::Idle),
            worker("a", Capability::Wildcard, WorkerStatus::Idle),
        ];
        let best = scorer
            .find_best_worker(&it, Role::Implementer, &workers, Utc::now())
            .unwrap();
        assert_eq!(best.id, WorkerId::from("a"));
    }
}
