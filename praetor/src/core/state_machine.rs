//! Phase transitions for a single task.
//!
//! [`apply_event`] is the only place that changes `status.phase`. It mutates
//! the task in memory and reports the side effects the caller must carry out
//! after the write is persisted. Terminal phases are never left.

use chrono::{DateTime, Utc};

use crate::core::children::resolve_pending;
use crate::core::retry::{RetryDecision, plan_retry};
use crate::core::types::{Effect, TaskEvent, TransitionSummary};
use crate::error::TransitionError;
use crate::task::{
    AttemptRecord, Condition, Phase, RetrySpec, StuckAction, Task, TaskStatus, format_duration,
};

/// Condition set when the stuck detector fires.
pub const CONDITION_STUCK: &str = "Stuck";
/// Condition set on a parent when a child is escalated.
pub const CONDITION_ESCALATED: &str = "Escalated";

/// Inputs the machine needs besides the task itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionContext {
    pub now: DateTime<Utc>,
    /// Used when the task declares no retry policy.
    pub retry_defaults: RetrySpec,
}

impl TransitionContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            retry_defaults: RetrySpec::default(),
        }
    }
}

/// Whether `from -> to` is an edge of the phase graph.
pub fn can_transition(from: Phase, to: Phase) -> bool {
    use Phase::{
        BudgetExceeded, Cancelled, Completed, Failed, Pending, Retrying, Running, TimedOut,
        Waiting,
    };
    match from {
        Pending => matches!(
            to,
            Running | Retrying | Failed | BudgetExceeded | Cancelled
        ),
        Running => matches!(
            to,
            Completed | Failed | Waiting | BudgetExceeded | TimedOut | Retrying | Cancelled
        ),
        Waiting => matches!(to, Running | Failed | BudgetExceeded | Cancelled),
        Retrying => matches!(to, Running | Failed | BudgetExceeded | Cancelled),
        Completed | Failed | BudgetExceeded | TimedOut | Cancelled => false,
    }
}

/// Apply `event` to `task`, returning the phase change and required effects.
///
/// On error the task is left untouched.
pub fn apply_event(
    task: &mut Task,
    event: TaskEvent,
    ctx: &TransitionContext,
) -> Result<TransitionSummary, TransitionError> {
    let from = task.status.phase;
    let mut effects = Vec::new();

    match event {
        TaskEvent::Started { unit_id } => start(task, unit_id, ctx)?,
        TaskEvent::Completed { output } => {
            require(from, Phase::Completed)?;
            if output.is_some() {
                task.status.output = output;
            }
            close_attempt(&mut task.status, ctx.now, Some(0), "completed");
            task.status.message = Some("Task completed".to_string());
            finish(task, Phase::Completed, ctx.now, &mut effects);
        }
        TaskEvent::ExecutionFailed {
            reason,
            exit_code,
            retryable,
        } => {
            let plan = plan_failure(task, task.status.attempts, retryable, ctx)?;
            close_attempt(&mut task.status, ctx.now, exit_code, &reason);
            fail_or_retry(task, plan, reason, ctx, &mut effects);
        }
        TaskEvent::ScheduleFailed { reason, retryable } => {
            if !matches!(from, Phase::Pending | Phase::Retrying) {
                return Err(illegal_or_terminal(from, Phase::Retrying));
            }
            let attempt = task.status.attempts.saturating_add(1);
            let plan = plan_failure(task, attempt, retryable, ctx)?;
            task.status.attempts = attempt;
            task.status.history.push(AttemptRecord {
                attempt,
                start_time: ctx.now,
                end_time: Some(ctx.now),
                exit_code: None,
                reason: Some(reason.clone()),
            });
            fail_or_retry(task, plan, reason, ctx, &mut effects);
        }
        TaskEvent::CheckpointedForChildren { pending } => {
            require(from, Phase::Waiting)?;
            let mut pending = pending;
            pending.sort();
            pending.dedup();
            if !pending.is_empty() {
                close_attempt(&mut task.status, ctx.now, Some(0), "waiting for children");
                task.status.message = Some(format!("Waiting for {} child task(s)", pending.len()));
                task.status.pending_children = pending;
                task.status.phase = Phase::Waiting;
            }
        }
        TaskEvent::ChildResolved { child } => {
            // A finished parent's record is final.
            if task.is_terminal() {
                return Ok(summary(from, task, effects));
            }
            resolve_pending(&mut task.status, &child);
        }
        TaskEvent::BudgetExceeded { reason } => {
            require(from, Phase::BudgetExceeded)?;
            terminate_if_running(task, from, &mut effects);
            close_attempt(&mut task.status, ctx.now, None, "budget exceeded");
            task.status.message = Some(reason);
            finish(task, Phase::BudgetExceeded, ctx.now, &mut effects);
        }
        TaskEvent::TimedOut { limit_secs } => {
            require(from, Phase::TimedOut)?;
            terminate_if_running(task, from, &mut effects);
            close_attempt(&mut task.status, ctx.now, None, "timed out");
            task.status.message = Some(format!("Task timed out after {limit_secs}s"));
            finish(task, Phase::TimedOut, ctx.now, &mut effects);
        }
        TaskEvent::Stuck { action, reason } => {
            if task.is_terminal() {
                return Err(TransitionError::AlreadyTerminal { phase: from });
            }
            if action != StuckAction::None {
                task.status.set_condition(Condition {
                    kind: CONDITION_STUCK.to_string(),
                    status: true,
                    reason: format!("Stuck{}", capitalize(action.as_str())),
                    message: reason.clone(),
                    last_transition_time: ctx.now,
                });
            }
            if matches!(action, StuckAction::Kill | StuckAction::Escalate) {
                require(from, Phase::Failed)?;
                terminate_if_running(task, from, &mut effects);
                close_attempt(&mut task.status, ctx.now, None, "stuck");
                task.status.message = Some(format!("stuck: {reason}"));
                if action == StuckAction::Escalate
                    && let Some(parent) = task.spec.parent()
                {
                    effects.push(Effect::Escalate {
                        parent: parent.to_string(),
                        reason: format!("child {} stuck: {reason}", task.name()),
                    });
                }
                finish(task, Phase::Failed, ctx.now, &mut effects);
            }
        }
        TaskEvent::ChildEscalated { child, reason } => {
            if task.is_terminal() {
                return Ok(summary(from, task, effects));
            }
            task.status.set_condition(Condition {
                kind: CONDITION_ESCALATED.to_string(),
                status: true,
                reason: "ChildStuck".to_string(),
                message: format!("child {child} escalated: {reason}"),
                last_transition_time: ctx.now,
            });
            if from == Phase::Waiting {
                task.status.message = Some(format!("escalated: child {child} stuck: {reason}"));
                finish(task, Phase::Failed, ctx.now, &mut effects);
            }
        }
        TaskEvent::Cancel { reason } => {
            require(from, Phase::Cancelled)?;
            close_attempt(&mut task.status, ctx.now, None, "cancelled");
            task.status.message = Some(reason);
            finish(task, Phase::Cancelled, ctx.now, &mut effects);
        }
        TaskEvent::Failed { reason } => {
            require(from, Phase::Failed)?;
            terminate_if_running(task, from, &mut effects);
            close_attempt(&mut task.status, ctx.now, None, &reason);
            task.status.message = Some(reason);
            finish(task, Phase::Failed, ctx.now, &mut effects);
        }
    }

    Ok(summary(from, task, effects))
}

fn summary(from: Phase, task: &Task, effects: Vec<Effect>) -> TransitionSummary {
    TransitionSummary {
        from,
        to: task.status.phase,
        effects,
    }
}

fn require(from: Phase, to: Phase) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(illegal_or_terminal(from, to))
    }
}

fn illegal_or_terminal(from: Phase, to: Phase) -> TransitionError {
    if from.is_terminal() {
        TransitionError::AlreadyTerminal { phase: from }
    } else {
        TransitionError::IllegalTransition { from, to }
    }
}

fn start(task: &mut Task, unit_id: String, ctx: &TransitionContext) -> Result<(), TransitionError> {
    let from = task.status.phase;
    require(from, Phase::Running)?;
    let status = &mut task.status;

    match from {
        Phase::Retrying => {
            if let Some(due) = status.next_retry_time
                && ctx.now < due
            {
                return Err(TransitionError::RetryNotDue {
                    next_retry_time: due.to_rfc3339(),
                });
            }
            status.attempts = status.attempts.saturating_add(1);
            status.last_reincarnated_at = Some(ctx.now);
            status.next_retry_time = None;
        }
        Phase::Waiting => {
            if !status.pending_children.is_empty() {
                return Err(TransitionError::ChildrenPending {
                    count: status.pending_children.len(),
                });
            }
            // Resuming consumes no retry; the attempt number is reused.
            status.last_reincarnated_at = Some(ctx.now);
        }
        _ => status.attempts = status.attempts.saturating_add(1),
    }

    status.history.push(AttemptRecord {
        attempt: status.attempts.max(1),
        start_time: ctx.now,
        end_time: None,
        exit_code: None,
        reason: None,
    });
    status.attempt_tokens_used = None;
    status.attempt_cost_usd = None;
    status.unit_id = Some(unit_id);
    status.started_at = Some(ctx.now);
    status.message = Some(match from {
        Phase::Waiting => "Task resumed after children finished".to_string(),
        Phase::Retrying => format!("Task running (attempt {})", status.attempts),
        _ => "Task running".to_string(),
    });
    status.phase = Phase::Running;
    Ok(())
}

/// Outcome of a failed attempt, checked against the phase graph before
/// anything on the task changes.
struct FailurePlan {
    decision: RetryDecision,
    max_attempts: u32,
}

fn plan_failure(
    task: &Task,
    attempt: u32,
    retryable: bool,
    ctx: &TransitionContext,
) -> Result<FailurePlan, TransitionError> {
    let from = task.status.phase;
    let policy = task
        .spec
        .retry
        .clone()
        .unwrap_or_else(|| ctx.retry_defaults.clone());
    let decision = if retryable {
        plan_retry(attempt, Some(&policy), ctx.now)
    } else {
        RetryDecision::Exhausted
    };
    let to = match decision {
        RetryDecision::Retry { .. } => Phase::Retrying,
        RetryDecision::Exhausted => Phase::Failed,
    };
    // A Retrying task whose restart failed stays Retrying.
    if !(from == Phase::Retrying && to == Phase::Retrying) {
        require(from, to)?;
    }
    Ok(FailurePlan {
        decision,
        max_attempts: policy.max_attempts,
    })
}

fn fail_or_retry(
    task: &mut Task,
    plan: FailurePlan,
    reason: String,
    ctx: &TransitionContext,
    effects: &mut Vec<Effect>,
) {
    match plan.decision {
        RetryDecision::Retry {
            backoff_secs,
            next_retry_time,
        } => {
            task.status.next_retry_time = Some(next_retry_time);
            task.status.message = Some(format!(
                "Retrying in {backoff_secs}s (attempt {}/{}): {reason}",
                task.status.attempts,
                plan.max_attempts.saturating_add(1)
            ));
            task.status.phase = Phase::Retrying;
        }
        RetryDecision::Exhausted => {
            task.status.message = Some(reason);
            finish(task, Phase::Failed, ctx.now, effects);
        }
    }
}

fn terminate_if_running(task: &Task, from: Phase, effects: &mut Vec<Effect>) {
    if from == Phase::Running
        && let Some(unit_id) = &task.status.unit_id
    {
        effects.push(Effect::TerminateUnit {
            unit_id: unit_id.clone(),
        });
    }
}

/// Close the open history record, if any.
fn close_attempt(status: &mut TaskStatus, now: DateTime<Utc>, exit_code: Option<i32>, reason: &str) {
    if let Some(record) = status.history.last_mut()
        && record.end_time.is_none()
    {
        record.end_time = Some(now);
        record.exit_code = exit_code;
        record.reason = Some(reason.to_string());
    }
}

fn finish(task: &mut Task, to: Phase, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
    let status = &mut task.status;
    status.phase = to;
    status.completed_at = Some(now);
    if let Some(started) = status.started_at {
        status.duration = Some(format_duration((now - started).num_seconds()));
    }
    status.pending_children.clear();
    status.next_retry_time = None;
    if let Some(parent) = task.spec.parent() {
        effects.push(Effect::NotifyParent {
            parent: parent.to_string(),
        });
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::invariants::check_phase_sequence;
    use crate::task::TokenUsage;
    use crate::test_support::{at, child, task};

    fn ctx(seconds: i64) -> TransitionContext {
        TransitionContext::new(at(seconds))
    }

    fn retrying_task(max_attempts: u32) -> Task {
        let mut t = task("worker");
        t.spec.retry = Some(RetrySpec {
            max_attempts,
            backoff_seconds: 30,
            max_backoff_seconds: 300,
        });
        t
    }

    fn started(mut t: Task, seconds: i64) -> Task {
        apply_event(
            &mut t,
            TaskEvent::Started {
                unit_id: "unit-1".to_string(),
            },
            &ctx(seconds),
        )
        .expect("start");
        t
    }

    fn crash(t: &mut Task, seconds: i64) -> TransitionSummary {
        apply_event(
            t,
            TaskEvent::ExecutionFailed {
                reason: "exit code 1".to_string(),
                exit_code: Some(1),
                retryable: true,
            },
            &ctx(seconds),
        )
        .expect("fail")
    }

    #[test]
    fn start_records_first_attempt() {
        let t = started(task("worker"), 0);
        assert_eq!(t.phase(), Phase::Running);
        assert_eq!(t.status.attempts, 1);
        assert_eq!(t.status.history.len(), 1);
        assert_eq!(t.status.history[0].attempt, 1);
        assert_eq!(t.status.started_at, Some(at(0)));
        assert_eq!(t.status.unit_id.as_deref(), Some("unit-1"));
    }

    #[test]
    fn completion_records_output_and_duration() {
        let mut t = started(task("worker"), 0);
        let summary = apply_event(
            &mut t,
            TaskEvent::Completed {
                output: Some("done".to_string()),
            },
            &ctx(90),
        )
        .expect("complete");
        assert_eq!(summary.to, Phase::Completed);
        assert!(summary.effects.is_empty());
        assert_eq!(t.status.output.as_deref(), Some("done"));
        assert_eq!(t.status.duration.as_deref(), Some("1m30s"));
        assert_eq!(t.status.history[0].exit_code, Some(0));
        assert_eq!(t.status.history[0].end_time, Some(at(90)));
    }

    #[test]
    fn child_completion_notifies_parent() {
        let mut t = started(child("kid", "boss"), 0);
        let summary = apply_event(
            &mut t,
            TaskEvent::Completed {
                output: None,
            },
            &ctx(1),
        )
        .expect("complete");
        assert_eq!(
            summary.effects,
            vec![Effect::NotifyParent {
                parent: "boss".to_string()
            }]
        );
    }

    #[test]
    fn transient_failure_retries_with_backoff() {
        let mut t = started(retrying_task(3), 0);
        let summary = crash(&mut t, 10);
        assert_eq!(summary.to, Phase::Retrying);
        assert_eq!(t.status.next_retry_time, Some(at(40)));
        assert_eq!(t.status.history[0].exit_code, Some(1));
        assert!(t.status.completed_at.is_none());
    }

    #[test]
    fn retry_start_waits_for_next_retry_time() {
        let mut t = started(retrying_task(3), 0);
        crash(&mut t, 10);
        let early = apply_event(
            &mut t,
            TaskEvent::Started {
                unit_id: "unit-2".to_string(),
            },
            &ctx(39),
        );
        assert!(matches!(early, Err(TransitionError::RetryNotDue { .. })));
        assert_eq!(t.phase(), Phase::Retrying);

        apply_event(
            &mut t,
            TaskEvent::Started {
                unit_id: "unit-2".to_string(),
            },
            &ctx(40),
        )
        .expect("restart");
        assert_eq!(t.phase(), Phase::Running);
        assert_eq!(t.status.attempts, 2);
        assert_eq!(t.status.last_reincarnated_at, Some(at(40)));
        assert_eq!(t.status.history.len(), 2);
        assert_eq!(t.status.history[1].attempt, 2);
        assert!(t.status.next_retry_time.is_none());
    }

    /// Attempts never exceed max retries + 1.
    #[test]
    fn exhausted_retries_fail_with_last_reason() {
        let mut t = started(retrying_task(2), 0);
        let mut now = 0;
        for _ in 0..2 {
            now += 1000;
            crash(&mut t, now);
            now += 1000;
            apply_event(
                &mut t,
                TaskEvent::Started {
                    unit_id: "again".to_string(),
                },
                &ctx(now),
            )
            .expect("restart");
        }
        let summary = apply_event(
            &mut t,
            TaskEvent::ExecutionFailed {
                reason: "OOMKilled".to_string(),
                exit_code: Some(137),
                retryable: true,
            },
            &ctx(now + 5),
        )
        .expect("final failure");
        assert_eq!(summary.to, Phase::Failed);
        assert_eq!(t.status.attempts, 3);
        assert_eq!(t.status.message.as_deref(), Some("OOMKilled"));
        assert_eq!(t.status.history.len(), 3);
    }

    #[test]
    fn non_retryable_failure_is_final() {
        let mut t = started(retrying_task(3), 0);
        let summary = apply_event(
            &mut t,
            TaskEvent::ExecutionFailed {
                reason: "ErrImagePull".to_string(),
                exit_code: None,
                retryable: false,
            },
            &ctx(5),
        )
        .expect("fail");
        assert_eq!(summary.to, Phase::Failed);
    }

    #[test]
    fn schedule_failure_consumes_an_attempt() {
        let mut t = retrying_task(1);
        let summary = apply_event(
            &mut t,
            TaskEvent::ScheduleFailed {
                reason: "no capacity".to_string(),
                retryable: true,
            },
            &ctx(0),
        )
        .expect("schedule failure");
        assert_eq!(summary.to, Phase::Retrying);
        assert_eq!(t.status.attempts, 1);

        let summary = apply_event(
            &mut t,
            TaskEvent::ScheduleFailed {
                reason: "still no capacity".to_string(),
                retryable: true,
            },
            &ctx(100),
        )
        .expect("second schedule failure");
        assert_eq!(summary.to, Phase::Failed);
        assert_eq!(t.status.attempts, 2);
    }

    #[test]
    fn waiting_resumes_only_when_children_resolve() {
        let mut t = started(task("boss"), 0);
        apply_event(
            &mut t,
            TaskEvent::CheckpointedForChildren {
                pending: vec!["b".to_string(), "a".to_string()],
            },
            &ctx(10),
        )
        .expect("checkpoint");
        assert_eq!(t.phase(), Phase::Waiting);
        assert_eq!(t.status.pending_children, vec!["a", "b"]);

        apply_event(
            &mut t,
            TaskEvent::ChildResolved {
                child: "a".to_string(),
            },
            &ctx(20),
        )
        .expect("resolve a");
        let blocked = apply_event(
            &mut t,
            TaskEvent::Started {
                unit_id: "resume".to_string(),
            },
            &ctx(21),
        );
        assert_eq!(blocked, Err(TransitionError::ChildrenPending { count: 1 }));

        apply_event(
            &mut t,
            TaskEvent::ChildResolved {
                child: "b".to_string(),
            },
            &ctx(30),
        )
        .expect("resolve b");
        apply_event(
            &mut t,
            TaskEvent::Started {
                unit_id: "resume".to_string(),
            },
            &ctx(31),
        )
        .expect("resume");
        assert_eq!(t.phase(), Phase::Running);
        assert_eq!(t.status.attempts, 1);
        assert_eq!(t.status.history.len(), 2);
        assert_eq!(t.status.history[1].attempt, 1);
        assert_eq!(t.status.last_reincarnated_at, Some(at(31)));
        assert_eq!(t.status.child_tasks, vec!["a", "b"]);
    }

    #[test]
    fn budget_exceeded_while_running_terminates_unit() {
        let mut t = started(task("worker"), 0);
        let summary = apply_event(
            &mut t,
            TaskEvent::BudgetExceeded {
                reason: "token budget exhausted: 10/10".to_string(),
            },
            &ctx(5),
        )
        .expect("budget");
        assert_eq!(summary.to, Phase::BudgetExceeded);
        assert_eq!(
            summary.effects,
            vec![Effect::TerminateUnit {
                unit_id: "unit-1".to_string()
            }]
        );
    }

    #[test]
    fn waiting_task_can_exceed_budget_and_clears_pending() {
        let mut t = started(task("boss"), 0);
        apply_event(
            &mut t,
            TaskEvent::CheckpointedForChildren {
                pending: vec!["a".to_string()],
            },
            &ctx(1),
        )
        .expect("checkpoint");
        apply_event(
            &mut t,
            TaskEvent::BudgetExceeded {
                reason: "hierarchy".to_string(),
            },
            &ctx(2),
        )
        .expect("budget");
        assert_eq!(t.phase(), Phase::BudgetExceeded);
        assert!(t.status.pending_children.is_empty());
    }

    #[test]
    fn timeout_terminates_unit() {
        let mut t = started(task("worker"), 0);
        t.spec.timeout = Some(60);
        let summary = apply_event(&mut t, TaskEvent::TimedOut { limit_secs: 60 }, &ctx(61)).expect("timeout");
        assert_eq!(summary.to, Phase::TimedOut);
        assert_eq!(t.status.message.as_deref(), Some("Task timed out after 60s"));
        assert_eq!(summary.effects.len(), 1);
    }

    #[test]
    fn stuck_warn_only_sets_condition() {
        let mut t = started(task("worker"), 0);
        let summary = apply_event(
            &mut t,
            TaskEvent::Stuck {
                action: StuckAction::Warn,
                reason: "repeated prompts (6 > 3)".to_string(),
            },
            &ctx(5),
        )
        .expect("warn");
        assert!(!summary.changed());
        let condition = t.status.condition(CONDITION_STUCK).expect("condition");
        assert_eq!(condition.reason, "StuckWarn");
    }

    #[test]
    fn stuck_kill_fails_with_stuck_reason() {
        let mut t = started(task("worker"), 0);
        apply_event(
            &mut t,
            TaskEvent::Stuck {
                action: StuckAction::Kill,
                reason: "loop".to_string(),
            },
            &ctx(5),
        )
        .expect("kill");
        assert_eq!(t.phase(), Phase::Failed);
        assert_eq!(t.status.history[0].reason.as_deref(), Some("stuck"));
    }

    #[test]
    fn stuck_escalate_notifies_parent_governance() {
        let mut t = started(child("kid", "boss"), 0);
        let summary = apply_event(
            &mut t,
            TaskEvent::Stuck {
                action: StuckAction::Escalate,
                reason: "loop".to_string(),
            },
            &ctx(5),
        )
        .expect("escalate");
        assert_eq!(summary.to, Phase::Failed);
        assert!(summary.effects.contains(&Effect::Escalate {
            parent: "boss".to_string(),
            reason: "child kid stuck: loop".to_string(),
        }));
    }

    #[test]
    fn waiting_parent_fails_when_child_escalates() {
        let mut t = started(task("boss"), 0);
        apply_event(
            &mut t,
            TaskEvent::CheckpointedForChildren {
                pending: vec!["kid".to_string(), "other".to_string()],
            },
            &ctx(1),
        )
        .expect("checkpoint");
        apply_event(
            &mut t,
            TaskEvent::ChildEscalated {
                child: "kid".to_string(),
                reason: "loop".to_string(),
            },
            &ctx(2),
        )
        .expect("escalated");
        assert_eq!(t.phase(), Phase::Failed);
        assert!(t.status.condition(CONDITION_ESCALATED).is_some());
    }

    #[test]
    fn cancel_of_completed_task_is_rejected_and_state_unchanged() {
        let mut t = started(task("worker"), 0);
        apply_event(
            &mut t,
            TaskEvent::Completed {
                output: Some("ok".to_string()),
            },
            &ctx(1),
        )
        .expect("complete");
        let before = t.clone();
        let result = apply_event(
            &mut t,
            TaskEvent::Cancel {
                reason: "user".to_string(),
            },
            &ctx(2),
        );
        assert_eq!(
            result,
            Err(TransitionError::AlreadyTerminal {
                phase: Phase::Completed
            })
        );
        assert_eq!(
            result.expect_err("rejected").to_string(),
            "task already in terminal state: Completed"
        );
        assert_eq!(t, before);
    }

    #[test]
    fn cancel_is_accepted_from_every_non_terminal_phase() {
        for phase in [Phase::Pending, Phase::Running, Phase::Waiting, Phase::Retrying] {
            let mut t = task("worker");
            t.status.phase = phase;
            let summary = apply_event(
                &mut t,
                TaskEvent::Cancel {
                    reason: "user".to_string(),
                },
                &ctx(0),
            )
            .expect("cancel");
            assert_eq!(summary.to, Phase::Cancelled);
            assert!(summary.effects.is_empty());
        }
    }

    #[test]
    fn no_event_leaves_a_terminal_phase() {
        let events = [
            TaskEvent::Started {
                unit_id: "u".to_string(),
            },
            TaskEvent::Completed {
                output: None,
            },
            TaskEvent::ExecutionFailed {
                reason: "x".to_string(),
                exit_code: Some(1),
                retryable: true,
            },
            TaskEvent::ScheduleFailed {
                reason: "x".to_string(),
                retryable: true,
            },
            TaskEvent::BudgetExceeded {
                reason: "x".to_string(),
            },
            TaskEvent::TimedOut { limit_secs: 60 },
            TaskEvent::Failed {
                reason: "x".to_string(),
            },
        ];
        for terminal in [
            Phase::Completed,
            Phase::Failed,
            Phase::BudgetExceeded,
            Phase::TimedOut,
            Phase::Cancelled,
        ] {
            for event in events.clone() {
                let mut t = task("worker");
                t.status.phase = terminal;
                let result = apply_event(&mut t, event, &ctx(0));
                assert_eq!(result, Err(TransitionError::AlreadyTerminal { phase: terminal }));
                assert_eq!(t.phase(), terminal);
            }
        }
    }

    #[test]
    fn observed_phase_sequence_is_monotonic() {
        let mut t = started(retrying_task(1), 0);
        let mut observed = vec![Phase::Pending, t.phase()];
        crash(&mut t, 1);
        observed.push(t.phase());
        apply_event(
            &mut t,
            TaskEvent::Started {
                unit_id: "u2".to_string(),
            },
            &ctx(100),
        )
        .expect("restart");
        observed.push(t.phase());
        crash(&mut t, 101);
        observed.push(t.phase());
        assert_eq!(observed.last(), Some(&Phase::Failed));
        assert!(check_phase_sequence(&observed).is_empty());
    }

    #[test]
    fn graph_has_no_edges_out_of_terminal_phases() {
        let all = [
            Phase::Pending,
            Phase::Running,
            Phase::Waiting,
            Phase::Retrying,
            Phase::Completed,
            Phase::Failed,
            Phase::BudgetExceeded,
            Phase::TimedOut,
            Phase::Cancelled,
        ];
        for from in all.iter().filter(|p| p.is_terminal()) {
            assert!(all.iter().all(|to| !can_transition(*from, *to)));
        }
        assert!(can_transition(Phase::Waiting, Phase::Running));
        assert!(!can_transition(Phase::Waiting, Phase::Completed));
        assert!(!can_transition(Phase::Pending, Phase::Completed));
    }

    /// Every start opens a fresh per-attempt report baseline; totals stay.
    #[test]
    fn restart_clears_the_attempt_report_baseline() {
        let mut t = started(retrying_task(3), 0);
        t.status.tokens_used = Some(TokenUsage::new(100, 0));
        t.status.attempt_tokens_used = Some(TokenUsage::new(100, 0));
        t.status.attempt_cost_usd = Some("0.100000".to_string());
        crash(&mut t, 10);
        apply_event(
            &mut t,
            TaskEvent::Started {
                unit_id: "unit-2".to_string(),
            },
            &ctx(40),
        )
        .expect("restart");
        assert_eq!(t.status.attempt_tokens_used, None);
        assert_eq!(t.status.attempt_cost_usd, None);
        assert_eq!(t.status.tokens_used, Some(TokenUsage::new(100, 0)));
    }

    #[test]
    fn child_resolution_leaves_a_finished_parent_untouched() {
        let mut t = started(task("boss"), 0);
        apply_event(
            &mut t,
            TaskEvent::Cancel {
                reason: "user".to_string(),
            },
            &ctx(1),
        )
        .expect("cancel");
        let before = t.clone();
        let summary = apply_event(
            &mut t,
            TaskEvent::ChildResolved {
                child: "late".to_string(),
            },
            &ctx(2),
        )
        .expect("ignored");
        assert!(!summary.changed());
        assert_eq!(t, before);
        assert!(t.status.child_tasks.is_empty());
    }

    /// Waiting has no edge to Retrying, so a failure report there is refused
    /// before anything changes.
    #[test]
    fn execution_failure_while_waiting_is_illegal() {
        let mut t = started(retrying_task(3), 0);
        apply_event(
            &mut t,
            TaskEvent::CheckpointedForChildren {
                pending: vec!["kid".to_string()],
            },
            &ctx(1),
        )
        .expect("checkpoint");
        let before = t.clone();
        let result = apply_event(
            &mut t,
            TaskEvent::ExecutionFailed {
                reason: "exit code 1".to_string(),
                exit_code: Some(1),
                retryable: true,
            },
            &ctx(2),
        );
        assert_eq!(
            result,
            Err(TransitionError::IllegalTransition {
                from: Phase::Waiting,
                to: Phase::Retrying
            })
        );
        assert_eq!(t, before);
    }

    #[test]
    fn failed_restart_stays_retrying() {
        let mut t = retrying_task(3);
        for attempt in 1..=2 {
            let summary = apply_event(
                &mut t,
                TaskEvent::ScheduleFailed {
                    reason: "no capacity".to_string(),
                    retryable: true,
                },
                &ctx(i64::from(attempt) * 1000),
            )
            .expect("schedule failure");
            assert_eq!(summary.to, Phase::Retrying);
            assert_eq!(t.status.attempts, attempt);
        }
    }
}
