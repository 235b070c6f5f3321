//! Structured error types for the orchestration core.
//!
//! Two layers, mirroring the split the reference coordination layer this
//! crate is grounded on draws between `SeesawError` and `anyhow::Error`:
//!
//! - [`OrchestratorError`] is raised by the core's own logic and is
//!   pattern-matchable.
//! - The five consumed interfaces (§6) return plain `anyhow::Error`; the
//!   core does not know or care what concrete error a store, pool,
//!   workflow, executor, or hook produces.
//!
//! [`ErrorCategory`] is a separate, smaller classification applied only to
//! *executor failure messages* (spec.md §4.4/§7) — never to
//! `OrchestratorError` itself.

use std::fmt;

use thiserror::Error;

use crate::types::WorkItemId;

/// Errors raised by the core's own bookkeeping.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A retry context or error-history entry was looked up for a work item
    /// the core has no record of.
    #[error("no retry context for work item {0}")]
    UnknownRetryContext(WorkItemId),

    /// The ledger was asked to register completion for a worker it never
    /// registered a start for — a bug in the caller, not a fairness
    /// violation.
    #[error("ledger has no in-flight entry for worker {0} on work item {1}")]
    UnregisteredCompletion(crate::types::WorkerId, WorkItemId),

    /// A consumed interface (store, pool, workflow, executor, or hook)
    /// returned an error. Wrapped so call sites can still match on
    /// `OrchestratorError` uniformly while preserving the underlying cause.
    #[error("{context}: {source}")]
    Upstream {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl OrchestratorError {
    pub fn upstream(context: &'static str, source: anyhow::Error) -> Self {
        Self::Upstream { context, source }
    }
}

/// Operational classification of an executor failure message (spec.md §4.4,
/// §7). Evaluated by case-insensitive keyword matching in
/// [`crate::retry::RetryEngine::categorize`]; the ordering there, not the
/// declaration order here, is the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Likely resolves on its own; retried with normal backoff.
    Transient,
    /// Provider pushed back; retried with amplified backoff.
    RateLimited,
    /// Memory/context/token exhaustion; retried at most twice.
    Resource,
    /// Human fix required; never retried.
    Validation,
    /// Internal/system failure; retried at most twice.
    System,
    /// Didn't match any keyword set; treated like `System`.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Validation => "validation",
            ErrorCategory::System => "system",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}
