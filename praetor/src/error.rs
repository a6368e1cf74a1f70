//! Typed errors for the cases callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context attached.

use thiserror::Error;

use crate::core::types::Violation;
use crate::task::{Phase, TaskKey};

/// Failures of the versioned task store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored resource version differs from the one the writer read.
    #[error("conflict on {key}: expected version {expected}, found {found}")]
    Conflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },
    /// A write tried to change a field that is fixed after creation.
    #[error("immutable field changed on {key}: {detail}")]
    Immutable { key: String, detail: String },
    #[error("storage failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Rejected phase transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task already in terminal state: {phase}")]
    AlreadyTerminal { phase: Phase },
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
    #[error("retry not due until {next_retry_time}")]
    RetryNotDue { next_retry_time: String },
    #[error("{count} child task(s) still pending")]
    ChildrenPending { count: usize },
}

/// A cost string that does not parse as a decimal number.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid cost value {raw:?}: must be a valid number")]
pub struct CostParseError {
    pub raw: String,
}

/// Admission refused the write. Carries every violation found.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("admission rejected {key}: {}", render_violations(.violations))]
pub struct AdmissionRejected {
    pub key: TaskKey,
    pub violations: Vec<Violation>,
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures walking parent links.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("parent task {parent} of {child} not found")]
    MissingParent { child: String, parent: String },
    #[error("hierarchy deeper than {max_depth} levels above {task}")]
    TooDeep { task: String, max_depth: usize },
}

/// Failures reported by the execution substrate when starting a unit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubstrateError {
    /// Scheduling hiccup; the attempt may be retried.
    #[error("execution unit could not be scheduled: {0}")]
    Retryable(String),
    #[error("execution unit rejected: {0}")]
    Fatal(String),
}

/// Failures charging a root's tree-wide counters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A stored cost on the root does not parse.
    #[error(transparent)]
    Cost(#[from] CostParseError),
}
