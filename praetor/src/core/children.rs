//! Parent/child bookkeeping.
//!
//! A parent that restarted (retry or Waiting resume) stamps
//! `lastReincarnatedAt`; children created before that instant belong to a
//! discarded attempt and are not counted.

use crate::task::{Task, TaskStatus};

/// Children of `parent` in `tasks` created by its current incarnation,
/// sorted by name.
pub fn discover_children<'a>(parent: &Task, tasks: &'a [Task]) -> Vec<&'a Task> {
    let cutoff = parent.status.last_reincarnated_at;
    let mut children: Vec<&Task> = tasks
        .iter()
        .filter(|task| task.is_child_of(parent))
        .filter(|task| match cutoff {
            None => true,
            Some(cutoff) => task.metadata.created_at.is_some_and(|created| created >= cutoff),
        })
        .collect();
    children.sort_by(|a, b| a.name().cmp(b.name()));
    children
}

/// Names of current-incarnation children that have not reached a terminal phase.
pub fn pending_children(parent: &Task, tasks: &[Task]) -> Vec<String> {
    discover_children(parent, tasks)
        .into_iter()
        .filter(|child| !child.is_terminal())
        .map(|child| child.name().to_string())
        .collect()
}

/// Record `child` as finished on its parent's status.
///
/// Adds it to `childTasks` (once) and drops it from `pendingChildren`.
/// Returns true when the pending set changed.
pub fn resolve_pending(status: &mut TaskStatus, child: &str) -> bool {
    if !status.child_tasks.iter().any(|name| name == child) {
        status.child_tasks.push(child.to_string());
    }
    let before = status.pending_children.len();
    status.pending_children.retain(|name| name != child);
    status.pending_children.len() != before
}

/// Add `child` to the pending set if it is not tracked yet.
pub fn register_pending(status: &mut TaskStatus, child: &str) -> bool {
    if status.pending_children.iter().any(|name| name == child) {
        return false;
    }
    status.pending_children.push(child.to_string());
    status.pending_children.sort();
    true
}
