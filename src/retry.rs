//! Error/retry engine (spec.md §4.4).

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::ErrorCategory;
use crate::types::{WorkItemId, WorkerId};

const ERROR_HISTORY_CAPACITY: usize = 10;
const LOG_CAPACITY: usize = 1_000;

/// Classifies an error message by case-insensitive keyword match. Order is
/// the contract (spec.md §4.4): first match wins.
pub fn categorize(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if any(&["rate limit", "429", "too many requests", "quota exceeded", "throttl"]) {
        ErrorCategory::RateLimited
    } else if any(&[
        "timeout",
        "timed out",
        "network",
        "connection",
        "econnrefused",
        "econnreset",
        "enotfound",
        "temporarily",
        "unavailable",
        "503",
        "502",
        "504",
        "retry",
        "socket hang up",
    ]) {
        ErrorCategory::Transient
    } else if any(&[
        "memory",
        "context window",
        "token limit",
        "max tokens",
        "resource exhausted",
        "out of resource",
        "insufficient",
        "limit exceeded",
        "heap",
        "allocation",
    ]) {
        ErrorCategory::Resource
    } else if any(&[
        "invalid",
        "validation",
        "not found",
        "does not exist",
        "400",
        "401",
        "403",
        "404",
        "malformed",
        "missing required",
        "unauthorized",
        "forbidden",
        "permission denied",
    ]) {
        ErrorCategory::Validation
    } else if any(&["internal", "500", "system", "unexpected", "fatal", "crash", "segfault", "exception"]) {
        ErrorCategory::System
    } else {
        ErrorCategory::Unknown
    }
}

/// Whether a retry is permitted for `category` at `retry_count` (attempts
/// already made), given `max_retry_attempts`.
pub fn should_retry(category: ErrorCategory, retry_count: u32, max_retry_attempts: u32) -> bool {
    let ceiling = match category {
        ErrorCategory::Validation => return false,
        ErrorCategory::RateLimited | ErrorCategory::Transient => max_retry_attempts,
        ErrorCategory::Resource | ErrorCategory::System | ErrorCategory::Unknown => max_retry_attempts.min(2),
    };
    retry_count < ceiling
}

/// Backoff delay (pre-jitter) for `category` at `retry_count`, given base and
/// cap in milliseconds (spec.md §4.4).
pub fn retry_delay_ms(category: ErrorCategory, retry_count: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let multiplier: u64 = match category {
        ErrorCategory::RateLimited => 5,
        ErrorCategory::Resource => 3,
        ErrorCategory::System => 2,
        _ => 1,
    };
    let base = base_delay_ms.saturating_mul(multiplier);
    let exp = base.saturating_mul(1u64 << retry_count.min(32));
    exp.min(max_delay_ms)
}

/// Applies uniform jitter in ±20% to a delay in milliseconds.
fn jitter_ms(delay_ms: u64) -> u64 {
    let delay = delay_ms as f64;
    let factor = 1.0 + (fastrand::f64() * 0.4 - 0.2);
    (delay * factor).max(0.0) as u64
}

/// Tuple of (work item id, error category, retry count, next-retry absolute
/// time, last-error string). At most one live retry per work item.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub work_item_id: WorkItemId,
    pub category: ErrorCategory,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
}

/// A single ring-buffered error record.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub message: String,
    pub worker_id: WorkerId,
}

/// Error history for one work item (spec.md §3 Error History Entry).
#[derive(Debug, Clone, Default)]
pub struct ErrorHistoryEntry {
    pub records: VecDeque<ErrorRecord>,
    pub total_failures: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub escalated: bool,
}

/// Fired when a work item's retries are exhausted or forbidden.
#[derive(Debug, Clone)]
pub struct EscalationEvent {
    pub work_item_id: WorkItemId,
    pub worker_id: WorkerId,
    pub category: ErrorCategory,
    pub total_failures: u64,
    pub history: ErrorHistoryEntry,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Level of a structured log entry in the retry engine's own ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single entry in the retry engine's observational log ring buffer.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    pub work_item_id: Option<WorkItemId>,
    pub category: Option<ErrorCategory>,
    pub message: String,
    pub retry_count: Option<u32>,
    pub will_retry: Option<bool>,
}

/// Filters for querying the log ring buffer.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub category: Option<ErrorCategory>,
    pub work_item_id: Option<WorkItemId>,
}

/// Snapshot counters for host-facing diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub pending_retries: usize,
    pub total_escalations: u64,
    pub log_entries: usize,
}

type EscalationHook = Box<dyn Fn(&EscalationEvent) + Send + Sync>;

struct State {
    retries: HashMap<WorkItemId, RetryContext>,
    history: HashMap<WorkItemId, ErrorHistoryEntry>,
    log: VecDeque<LogEntry>,
    hooks: Vec<EscalationHook>,
    total_escalations: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            retries: HashMap::new(),
            history: HashMap::new(),
            log: VecDeque::new(),
            hooks: Vec::new(),
            total_escalations: 0,
        }
    }
}

/// The retry engine component.
pub struct RetryEngine {
    state: Mutex<State>,
    max_retry_attempts: AtomicU32,
    base_delay_ms: AtomicU64,
    max_delay_ms: AtomicU64,
}

impl RetryEngine {
    pub fn new(max_retry_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_retry_attempts: AtomicU32::new(max_retry_attempts),
            base_delay_ms: AtomicU64::new(base_delay_ms),
            max_delay_ms: AtomicU64::new(max_delay_ms),
        }
    }

    /// Atomically replaces the retry ceiling and backoff base/cap. Pending
    /// retry contexts are unaffected; only future scheduling honours the
    /// new values.
    pub fn update_limits(&self, max_retry_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) {
        self.max_retry_attempts.store(max_retry_attempts, Ordering::SeqCst);
        self.base_delay_ms.store(base_delay_ms, Ordering::SeqCst);
        self.max_delay_ms.store(max_delay_ms, Ordering::SeqCst);
    }

    pub fn categorize(&self, message: &str) -> ErrorCategory {
        let category = categorize(message);
        self.push_log(LogEntry {
            level: LogLevel::Debug,
            timestamp: Utc::now(),
            work_item_id: None,
            category: Some(category),
            message: format!("categorized: {message}"),
            retry_count: None,
            will_retry: None,
        });
        category
    }

    pub fn should_retry(&self, category: ErrorCategory, retry_count: u32) -> bool {
        should_retry(category, retry_count, self.max_retry_attempts.load(Ordering::SeqCst))
    }

    pub fn retry_delay(&self, category: ErrorCategory, retry_count: u32) -> u64 {
        retry_delay_ms(
            category,
            retry_count,
            self.base_delay_ms.load(Ordering::SeqCst),
            self.max_delay_ms.load(Ordering::SeqCst),
        )
    }

    /// Computes and stores a retry context for `id`, overwriting any
    /// existing one, or returns `None` if policy forbids a retry.
    pub fn schedule_retry(&self, id: &WorkItemId, err: &str, retry_count: u32) -> Option<RetryContext> {
        let category = self.categorize(err);
        self.schedule_retry_as(id, err, retry_count, category)
    }

    /// Same as [`Self::schedule_retry`], but with the category supplied by
    /// the caller instead of derived from the message — used for failures
    /// whose category is dictated by the call site rather than the error
    /// text (e.g. a pre-execution hook veto, which is always `validation`).
    pub fn schedule_retry_as(&self, id: &WorkItemId, err: &str, retry_count: u32, category: ErrorCategory) -> Option<RetryContext> {
        if !self.should_retry(category, retry_count) {
            self.push_log(LogEntry {
                level: LogLevel::Info,
                timestamp: Utc::now(),
                work_item_id: Some(id.clone()),
                category: Some(category),
                message: err.to_string(),
                retry_count: Some(retry_count),
                will_retry: Some(false),
            });
            return None;
        }
        let delay = jitter_ms(self.retry_delay(category, retry_count));
        let next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay as i64);
        let ctx = RetryContext {
            work_item_id: id.clone(),
            category,
            retry_count: retry_count + 1,
            next_retry_at,
            last_error: err.to_string(),
        };
        self.push_log(LogEntry {
            level: LogLevel::Info,
            timestamp: Utc::now(),
            work_item_id: Some(id.clone()),
            category: Some(category),
            message: err.to_string(),
            retry_count: Some(retry_count),
            will_retry: Some(true),
        });
        self.state.lock().unwrap().retries.insert(id.clone(), ctx.clone());
        Some(ctx)
    }

    /// Returns and removes all retry contexts whose `next_retry_at` has
    /// passed. No ordering guarantee (spec.md §9 Open Question #1).
    pub fn ready_retries(&self) -> Vec<RetryContext> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let ready_ids: Vec<WorkItemId> = state
            .retries
            .iter()
            .filter(|(_, ctx)| ctx.next_retry_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        ready_ids
            .into_iter()
            .filter_map(|id| state.retries.remove(&id))
            .collect()
    }

    /// Removes a pending retry context for `id`, if any.
    pub fn cancel_retry(&self, id: &WorkItemId) {
        self.state.lock().unwrap().retries.remove(id);
    }

    /// Appends an error record to `id`'s ring (capacity 10), incrementing
    /// `total_failures` and updating `last_failure_at`.
    pub fn record_error(&self, id: &WorkItemId, category: ErrorCategory, message: &str, worker_id: &WorkerId) {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let entry = state.history.entry(id.clone()).or_default();
        entry.records.push_back(ErrorRecord {
            timestamp: now,
            category,
            message: message.to_string(),
            worker_id: worker_id.clone(),
        });
        while entry.records.len() > ERROR_HISTORY_CAPACITY {
            entry.records.pop_front();
        }
        entry.total_failures += 1;
        entry.last_failure_at = Some(now);
    }

    pub fn error_history(&self, id: &WorkItemId) -> Option<ErrorHistoryEntry> {
        self.state.lock().unwrap().history.get(id).cloned()
    }

    /// Clears the error history for a work item, called on successful
    /// completion (spec.md §4.4).
    pub fn clear_error_history(&self, id: &WorkItemId) {
        self.state.lock().unwrap().history.remove(id);
    }

    pub fn register_escalation_hook<F>(&self, hook: F)
    where
        F: Fn(&EscalationEvent) + Send + Sync + 'static,
    {
        self.state.lock().unwrap().hooks.push(Box::new(hook));
    }

    /// Marks the history entry escalated, builds an [`EscalationEvent`], and
    /// invokes every registered hook. A hook's panic is logged and does not
    /// abort the remaining hooks.
    pub fn escalate(&self, id: &WorkItemId, worker_id: &WorkerId, err: &str, category: ErrorCategory) -> EscalationEvent {
        let (total_failures, history) = {
            let mut state = self.state.lock().unwrap();
            let entry = state.history.entry(id.clone()).or_default();
            entry.escalated = true;
            (entry.total_failures, entry.clone())
        };
        let event = EscalationEvent {
            work_item_id: id.clone(),
            worker_id: worker_id.clone(),
            category,
            total_failures,
            history,
            timestamp: Utc::now(),
            reason: format!("exhausted retries for category {category}: {err}"),
        };

        self.state.lock().unwrap().total_escalations += 1;
        error!(work_item_id = %id, %category, "escalating work item");

        let hooks_count = { self.state.lock().unwrap().hooks.len() };
        for i in 0..hooks_count {
            let result = {
                let state = self.state.lock().unwrap();
                let hook = &state.hooks[i];
                catch_unwind(AssertUnwindSafe(|| hook(&event)))
            };
            if result.is_err() {
                warn!(work_item_id = %id, "escalation hook panicked");
            }
        }

        event
    }

    fn push_log(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Debug => tracing::debug!("{}", entry.message),
            LogLevel::Info => info!("{}", entry.message),
            LogLevel::Warn => warn!("{}", entry.message),
            LogLevel::Error => error!("{}", entry.message),
        }
        let mut state = self.state.lock().unwrap();
        state.log.push_back(entry);
        while state.log.len() > LOG_CAPACITY {
            state.log.pop_front();
        }
    }

    /// Appends a structured log entry directly (used by the driver for
    /// events outside categorize/schedule, e.g. "logError").
    pub fn log(&self, entry: LogEntry) {
        self.push_log(entry);
    }

    /// Most recent log entries matching `filter`, oldest first.
    pub fn recent_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|e| filter.level.map_or(true, |lvl| lvl == e.level))
            .filter(|e| filter.category.map_or(true, |c| Some(c) == e.category))
            .filter(|e| {
                filter
                    .work_item_id
                    .as_ref()
                    .map_or(true, |id| Some(id) == e.work_item_id.as_ref())
            })
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RetryStats {
        let state = self.state.lock().unwrap();
        RetryStats {
            pending_retries: state.retries.len(),
            total_escalations: state.total_escalations,
            log_entries: state.log.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorization_order_prefers_rate_limited_over_system() {
        assert_eq!(categorize("503 rate limit exceeded"), ErrorCategory::RateLimited);
        assert_eq!(categorize("500 internal error"), ErrorCategory::System);
    }

    #[test]
    fn validation_never_retries() {
        assert!(!should_retry(ErrorCategory::Validation, 0, 3));
    }

    #[test]
    fn transient_retries_up_to_max_minus_one() {
        assert!(should_retry(ErrorCategory::Transient, 2, 3));
        assert!(!should_retry(ErrorCategory::Transient, 3, 3));
    }

    #[test]
    fn resource_caps_at_two_even_with_higher_max() {
        assert!(should_retry(ErrorCategory::Resource, 1, 5));
        assert!(!should_retry(ErrorCategory::Resource, 2, 5));
    }

    #[test]
    fn backoff_before_jitter_for_rate_limited_first_attempt() {
        let delay = retry_delay_ms(ErrorCategory::RateLimited, 0, 1_000, 60_000);
        assert_eq!(delay, 5_000);
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let delay = retry_delay_ms(ErrorCategory::RateLimited, 10, 1_000, 60_000);
        assert_eq!(delay, 60_000);
    }

    #[test]
    fn schedule_retry_returns_none_for_validation() {
        let engine = RetryEngine::new(3, 1_000, 60_000);
        let id = WorkItemId::from("w1");
        assert!(engine.schedule_retry(&id, "invalid input", 0).is_none());
    }

    #[test]
    fn error_history_ring_caps_at_ten() {
        let engine = RetryEngine::new(3, 1_000, 60_000);
        let id = WorkItemId::from("w1");
        let worker = WorkerId::from("a1");
        for i in 0..15 {
            engine.record_error(&id, ErrorCategory::Transient, &format!("err {i}"), &worker);
        }
        let entry = engine.error_history(&id).unwrap();
        assert_eq!(entry.records.len(), 10);
        assert_eq!(entry.total_failures, 15);
    }

    #[test]
    fn escalation_marks_history_and_runs_hooks() {
        let engine = RetryEngine::new(3, 1_000, 60_000);
        let id = WorkItemId::from("w1");
        let worker = WorkerId::from("a1");
        engine.record_error(&id, ErrorCategory::System, "boom", &worker);

        let called = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let called_clone = called.clone();
        engine.register_escalation_hook(move |_event| {
            called_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        engine.register_escalation_hook(|_event| panic!("misbehaving hook"));

        let event = engine.escalate(&id, &worker, "boom", ErrorCategory::System);
        assert!(event.history.escalated);
        assert_eq!(called.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
