//! Status invariants that must hold at every observed state.

use crate::core::state_machine::can_transition;
use crate::task::{Phase, Task};

/// Check one task's status against its spec.
///
/// `default_max_attempts` is the retry count applied when the task declares
/// no retry policy.
pub fn check_status_invariants(task: &Task, default_max_attempts: u32) -> Vec<String> {
    let mut errors = Vec::new();
    let name = task.name();
    let status = &task.status;

    if !status.pending_children.is_empty() && status.phase != Phase::Waiting {
        errors.push(format!(
            "{name}: pendingChildren non-empty in phase {}",
            status.phase
        ));
    }

    let tracks_hierarchy =
        status.hierarchy_tokens_used.is_some() || status.hierarchy_cost_used.is_some();
    if tracks_hierarchy && !(task.spec.is_root() && task.spec.hierarchy_budget.is_some()) {
        errors.push(format!(
            "{name}: hierarchy usage recorded on a task that is not a root with a hierarchy budget"
        ));
    }

    if let Some(charged) = status.hierarchy_charged_tokens {
        let used = status.tokens_used.unwrap_or_default();
        if charged.input > used.input || charged.output > used.output {
            errors.push(format!(
                "{name}: hierarchy charge {} exceeds tokensUsed {}",
                charged.total(),
                used.total()
            ));
        }
    }

    let max_retries = task.spec.retry_max_attempts(default_max_attempts);
    if status.attempts > max_retries.saturating_add(1) {
        errors.push(format!(
            "{name}: attempts {} exceeds max attempts {} + 1",
            status.attempts, max_retries
        ));
    }

    if status.next_retry_time.is_some() && status.phase != Phase::Retrying {
        errors.push(format!(
            "{name}: nextRetryTime set in phase {}",
            status.phase
        ));
    }

    if status.phase.is_terminal() && status.completed_at.is_none() {
        errors.push(format!("{name}: terminal phase without completedAt"));
    }

    errors
}

/// Check a sequence of observed phases for one task.
///
/// Repeated observations of the same phase are fine; every change must be an
/// edge of the phase graph, so nothing follows a terminal phase.
pub fn check_phase_sequence(observed: &[Phase]) -> Vec<String> {
    observed
        .windows(2)
        .filter(|pair| pair[0] != pair[1])
        .filter_map(|pair| {
            let (from, to) = (pair[0], pair[1]);
            if from.is_terminal() {
                Some(format!("terminal phase {from} followed by {to}"))
            } else if !can_transition(from, to) {
                Some(format!("illegal transition {from} -> {to}"))
            } else {
                None
            }
        })
        .collect()
}
