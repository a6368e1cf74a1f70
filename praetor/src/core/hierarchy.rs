//! Walking `parentTaskId` links over a snapshot of one namespace.

use std::collections::BTreeSet;

use crate::error::HierarchyError;
use crate::task::Task;

/// Parent of `task` within `tasks`, if it has one.
pub fn parent_of<'a>(task: &Task, tasks: &'a [Task]) -> Result<Option<&'a Task>, HierarchyError> {
    let Some(parent_name) = task.spec.parent() else {
        return Ok(None);
    };
    tasks
        .iter()
        .find(|candidate| {
            candidate.metadata.namespace == task.metadata.namespace
                && candidate.name() == parent_name
        })
        .map(Some)
        .ok_or_else(|| HierarchyError::MissingParent {
            child: task.name().to_string(),
            parent: parent_name.to_string(),
        })
}

/// Ancestors of `task`, nearest first, ending at the root.
///
/// Fails when a link is dangling or the chain is deeper than `max_depth`.
pub fn ancestors<'a>(
    task: &Task,
    tasks: &'a [Task],
    max_depth: usize,
) -> Result<Vec<&'a Task>, HierarchyError> {
    let mut chain: Vec<&Task> = Vec::new();
    let mut current = parent_of(task, tasks)?;
    while let Some(parent) = current {
        if chain.len() >= max_depth {
            return Err(HierarchyError::TooDeep {
                task: task.name().to_string(),
                max_depth,
            });
        }
        chain.push(parent);
        current = parent_of(parent, tasks)?;
    }
    Ok(chain)
}

/// Name of the root of `task`'s tree (the task itself when it is a root).
pub fn find_root(task: &Task, tasks: &[Task], max_depth: usize) -> Result<String, HierarchyError> {
    let chain = ancestors(task, tasks, max_depth)?;
    Ok(chain
        .last()
        .map_or_else(|| task.name().to_string(), |root| root.name().to_string()))
}

/// Names of every task in the tree rooted at `root`, root included.
///
/// Links are followed at most `max_depth` levels below the root.
pub fn tree_members(root: &Task, tasks: &[Task], max_depth: usize) -> BTreeSet<String> {
    let mut members = BTreeSet::from([root.name().to_string()]);
    for _ in 0..max_depth {
        let mut changed = false;
        for task in tasks {
            if task.metadata.namespace != root.metadata.namespace
                || members.contains(task.name())
            {
                continue;
            }
            if task.spec.parent().is_some_and(|parent| members.contains(parent)) {
                members.insert(task.name().to_string());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    members
}

/// Members of the tree rooted at `root`, parents before their children.
///
/// Tasks at the same depth are ordered by name. Walking a tree in this order
/// means no task is visited before its parent.
pub fn members_top_down<'a>(root: &Task, tasks: &'a [Task], max_depth: usize) -> Vec<&'a Task> {
    let members = tree_members(root, tasks, max_depth);
    let mut ordered: Vec<(usize, &Task)> = tasks
        .iter()
        .filter(|task| {
            task.metadata.namespace == root.metadata.namespace && members.contains(task.name())
        })
        .map(|task| {
            let depth = ancestors(task, tasks, max_depth).map_or(usize::MAX, |chain| chain.len());
            (depth, task)
        })
        .collect();
    ordered.sort_by(|a, b| (a.0, a.1.name()).cmp(&(b.0, b.1.name())));
    ordered.into_iter().map(|(_, task)| task).collect()
}

/// `/`-separated path from the root down to `task`.
pub fn task_path(task: &Task, tasks: &[Task], max_depth: usize) -> Result<String, HierarchyError> {
    let chain = ancestors(task, tasks, max_depth)?;
    let mut names: Vec<&str> = chain.iter().rev().map(|t| t.name()).collect();
    names.push(task.name());
    Ok(names.join("/"))
}
