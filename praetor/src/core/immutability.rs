//! Write-once checks for task identity and spec.

use crate::task::Task;

/// Fields of `next` that differ from `prev` but must not change after
/// creation. Empty when the update only touches status or mutable metadata.
pub fn check_task_update(prev: &Task, next: &Task) -> Vec<String> {
    let mut errors = Vec::new();
    if prev.metadata.namespace != next.metadata.namespace {
        errors.push(format!(
            "metadata.namespace changed from '{}' to '{}'",
            prev.metadata.namespace, next.metadata.namespace
        ));
    }
    if prev.metadata.name != next.metadata.name {
        errors.push(format!(
            "metadata.name changed from '{}' to '{}'",
            prev.metadata.name, next.metadata.name
        ));
    }
    if prev.metadata.created_at != next.metadata.created_at {
        errors.push("metadata.createdAt changed".to_string());
    }
    if prev.metadata.no_cache != next.metadata.no_cache {
        errors.push("metadata.noCache changed".to_string());
    }
    if prev.spec != next.spec {
        errors.push("spec changed".to_string());
    }
    errors
}
