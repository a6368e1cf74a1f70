//! Timer checks and deterministic reconcile ordering.

use chrono::{DateTime, Duration, Utc};

use crate::task::{Phase, Task, TaskKey};

/// Effective timeout in seconds: the task's own, else the default.
pub fn effective_timeout(task: &Task, default_secs: i64) -> i64 {
    task.spec.timeout.filter(|secs| *secs > 0).unwrap_or(default_secs)
}

/// True once a Running task has been running longer than its timeout.
pub fn timed_out(task: &Task, now: DateTime<Utc>, default_timeout_secs: i64) -> bool {
    if task.phase() != Phase::Running {
        return false;
    }
    let Some(started) = task.status.started_at else {
        return false;
    };
    let timeout = effective_timeout(task, default_timeout_secs);
    timeout > 0 && (now - started).num_seconds() > timeout
}

/// True when a Retrying task may start its next attempt.
pub fn retry_due(task: &Task, now: DateTime<Utc>) -> bool {
    task.phase() == Phase::Retrying && task.status.next_retry_time.is_none_or(|due| due <= now)
}

/// Time until the next timer for `task` fires, if any.
pub fn next_timer(task: &Task, now: DateTime<Utc>, default_timeout_secs: i64) -> Option<Duration> {
    match task.phase() {
        Phase::Retrying => Some(
            task.status
                .next_retry_time
                .map_or_else(Duration::zero, |due| (due - now).max(Duration::zero())),
        ),
        Phase::Running => {
            let started = task.status.started_at?;
            let deadline = Duration::try_seconds(effective_timeout(task, default_timeout_secs))
                .and_then(|timeout| started.checked_add_signed(timeout))?;
            Some((deadline - now).max(Duration::zero()))
        }
        _ => None,
    }
}

/// Keys in reconcile order: oldest first, then by name.
pub fn reconcile_order(tasks: &[Task]) -> Vec<TaskKey> {
    let mut ordered: Vec<&Task> = tasks.iter().collect();
    ordered.sort_by(|a, b| {
        (a.metadata.created_at, &a.metadata.namespace, a.name())
            .cmp(&(b.metadata.created_at, &b.metadata.namespace, b.name()))
    });
    ordered.into_iter().map(Task::key).collect()
}
