//! Shared deterministic types for the lifecycle core.
//!
//! These are the contracts between the validator, the state machine, and the
//! reconciler. They carry no I/O handles and compare by value.

use std::fmt;

use crate::task::{Phase, StuckAction};

/// Category of a field violation, mirroring the cluster API's field errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    Required,
    Invalid,
    Forbidden,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::Required => "Required value",
            ViolationKind::Invalid => "Invalid value",
            ViolationKind::Forbidden => "Forbidden",
        }
    }
}

/// One field-qualified admission failure, e.g. `spec.tier: Forbidden: ...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Violation {
    pub field: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn required(field: &str, message: impl Into<String>) -> Self {
        Self::new(field, ViolationKind::Required, message)
    }

    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::new(field, ViolationKind::Invalid, message)
    }

    pub fn forbidden(field: &str, message: impl Into<String>) -> Self {
        Self::new(field, ViolationKind::Forbidden, message)
    }

    fn new(field: &str, kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.field, self.kind.as_str(), self.message)
    }
}

/// Observed happenings that drive a task's phase.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// An execution unit was started for a new attempt (or a Waiting resume).
    Started { unit_id: String },
    /// The unit exited successfully. Usage arrives through reports.
    Completed { output: Option<String> },
    /// The unit exited unsuccessfully or vanished.
    ExecutionFailed {
        reason: String,
        exit_code: Option<i32>,
        retryable: bool,
    },
    /// The substrate refused to start a unit.
    ScheduleFailed { reason: String, retryable: bool },
    /// The unit checkpointed and is waiting on the listed children.
    CheckpointedForChildren { pending: Vec<String> },
    /// A pending child reached a terminal phase.
    ChildResolved { child: String },
    /// A ceiling was reached, before or during execution.
    BudgetExceeded { reason: String },
    /// Elapsed time since start passed the effective timeout.
    TimedOut { limit_secs: i64 },
    /// The stuck detector produced a non-`none` action.
    Stuck { action: StuckAction, reason: String },
    /// A child was escalated as stuck.
    ChildEscalated { child: String, reason: String },
    /// Explicit external cancellation.
    Cancel { reason: String },
    /// Unrecoverable orchestration fault (e.g. the parent vanished).
    Failed { reason: String },
}

impl TaskEvent {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            TaskEvent::Started { .. } => "started",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::ExecutionFailed { .. } => "execution_failed",
            TaskEvent::ScheduleFailed { .. } => "schedule_failed",
            TaskEvent::CheckpointedForChildren { .. } => "checkpointed",
            TaskEvent::ChildResolved { .. } => "child_resolved",
            TaskEvent::BudgetExceeded { .. } => "budget_exceeded",
            TaskEvent::TimedOut { .. } => "timed_out",
            TaskEvent::Stuck { .. } => "stuck",
            TaskEvent::ChildEscalated { .. } => "child_escalated",
            TaskEvent::Cancel { .. } => "cancel",
            TaskEvent::Failed { .. } => "failed",
        }
    }
}

/// Side effects the caller must carry out after persisting a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Force-terminate the task's execution unit.
    TerminateUnit { unit_id: String },
    /// The task became terminal; its parent must learn about it.
    NotifyParent { parent: String },
    /// Stuck escalation; the parent gets an `Escalated` condition.
    Escalate { parent: String, reason: String },
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionSummary {
    pub from: Phase,
    pub to: Phase,
    pub effects: Vec<Effect>,
}

impl TransitionSummary {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}
