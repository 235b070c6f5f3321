//! # Orchestrator Core
//!
//! The scheduling brain of a multi-tenant agent orchestrator: a priority
//! work queue, an assignment scorer, a progress tracker, an error/retry
//! engine, and a concurrency ledger, composed by a driver loop.
//!
//! ## What this crate is
//!
//! A library with no binary target, meant to be embedded by a host process
//! that owns the work-item store, the worker pool, the agent executor, and
//! whatever wire protocol it exposes to users. The five interfaces this core
//! consumes ([`interfaces::WorkStore`], [`interfaces::WorkerPool`],
//! [`interfaces::Workflow`], [`interfaces::Executor`], plus the hook and sink
//! traits) are the entire contract; everything else about persistence, HTTP,
//! auth, and LLM calls is the host's problem.
//!
//! ## What this crate is not
//!
//! It does not execute agent code, speak to any LLM provider, mutate source
//! files, manage containers, authenticate users, or serve HTTP.
//!
//! ## Composing the pieces
//!
//! Most hosts only need [`driver::DriverLoop`]: construct it with a
//! [`config::OrchestratorConfig`] and a [`driver::Collaborators`] bundle,
//! register any hooks, then spawn [`driver::DriverLoop::start`]. The
//! individual components ([`queue::PriorityQueue`], [`scorer::AssignmentScorer`],
//! [`progress::ProgressTracker`], [`retry::RetryEngine`],
//! [`ledger::ConcurrencyLedger`]) are public for hosts that want to drive
//! them directly or inspect their state for diagnostics.

pub mod config;
pub mod driver;
pub mod error;
pub mod interfaces;
pub mod ledger;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod scorer;
pub mod testing;
pub mod types;

pub use config::{OrchestratorConfig, PartialOrchestratorConfig, ScoringWeights};
pub use driver::{Collaborators, DriverLoop, DriverStatus};
pub use error::{ErrorCategory, OrchestratorError};
pub use ledger::{ConcurrencyLedger, LedgerStatus, StartDecision};
pub use progress::{ProgressEvent, ProgressStatus, ProgressTracker};
pub use queue::{PriorityQueue, QueueItem};
pub use retry::{EscalationEvent, ErrorHistoryEntry, LogEntry, LogFilter, LogLevel, RetryContext, RetryEngine, RetryStats};
pub use scorer::AssignmentScorer;
pub use types::{
    Capability, Role, Template, WorkItem, WorkItemId, WorkItemPatch, WorkItemStatus, WorkItemType, Worker, WorkerId,
    WorkerStatus,
};
