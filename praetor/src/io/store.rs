//! Versioned resource store and the optimistic-concurrency update loop.
//!
//! Every task carries a `resourceVersion`. A write succeeds only when the
//! stored version still equals the one the writer read; otherwise the store
//! returns [`StoreError::Conflict`] and the caller re-reads and recomputes.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::immutability::check_task_update;
use crate::error::StoreError;
use crate::policy::Policy;
use crate::role::Role;
use crate::task::{Task, TaskKey};

/// Persistence for tasks, roles, and policies.
///
/// Implementations must be safe to share across threads; concurrent writers
/// are serialized only by the version check.
pub trait TaskStore: Send + Sync {
    fn get_task(&self, key: &TaskKey) -> Result<Task, StoreError>;

    /// All tasks in `namespace`, sorted by name.
    fn list_tasks(&self, namespace: &str) -> Result<Vec<Task>, StoreError>;

    /// Namespaces that hold at least one task, sorted.
    fn list_namespaces(&self) -> Result<Vec<String>, StoreError>;

    /// Insert a new task at version 1, stamping `createdAt` with `now`.
    fn create_task(&self, task: &Task, now: DateTime<Utc>) -> Result<Task, StoreError>;

    /// Compare-and-swap on `resourceVersion`. Returns the stored copy.
    fn update_task(&self, task: &Task) -> Result<Task, StoreError>;

    fn delete_task(&self, key: &TaskKey) -> Result<(), StoreError>;

    fn list_roles(&self, namespace: &str) -> Result<Vec<Role>, StoreError>;

    fn list_cluster_roles(&self) -> Result<Vec<Role>, StoreError>;

    fn list_policies(&self, namespace: &str) -> Result<Vec<Policy>, StoreError>;
}

/// Validate and version an update against the currently stored copy.
pub(crate) fn prepare_update(stored: &Task, proposed: &Task) -> Result<Task, StoreError> {
    let key = proposed.key().to_string();
    if stored.metadata.resource_version != proposed.metadata.resource_version {
        return Err(StoreError::Conflict {
            key,
            expected: proposed.metadata.resource_version,
            found: stored.metadata.resource_version,
        });
    }
    let errors = check_task_update(stored, proposed);
    if !errors.is_empty() {
        return Err(StoreError::Immutable {
            key,
            detail: errors.join("; "),
        });
    }
    let mut next = proposed.clone();
    next.metadata.resource_version = stored.metadata.resource_version + 1;
    Ok(next)
}

/// Read-modify-write `key` until the write lands or `limit` conflicts occur.
///
/// `mutate` is re-run against a fresh copy after every conflict, so it must
/// derive its change from the task it is given. Returning `Ok(None)` skips the
/// write; any error from `mutate` aborts the loop unchanged.
pub fn update_with_retry<S, T, E, F>(
    store: &S,
    key: &TaskKey,
    limit: u32,
    mut mutate: F,
) -> Result<(Task, Option<T>), E>
where
    S: TaskStore + ?Sized,
    E: From<StoreError>,
    F: FnMut(&mut Task) -> Result<Option<T>, E>,
{
    let mut conflicts = 0;
    loop {
        let mut task = store.get_task(key)?;
        let Some(outcome) = mutate(&mut task)? else {
            return Ok((task, None));
        };
        match store.update_task(&task) {
            Ok(stored) => return Ok((stored, Some(outcome))),
            Err(err) if err.is_conflict() && conflicts + 1 < limit => {
                conflicts += 1;
                debug!(task = %key, conflicts, "write conflict, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<TaskKey, Task>,
    roles: Vec<Role>,
    policies: Vec<Policy>,
}

/// Thread-safe in-process store. Used by tests and embedders.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))
    }

    pub fn put_role(&self, role: Role) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .roles
            .retain(|r| !(r.name == role.name && r.namespace == role.namespace));
        inner.roles.push(role);
        Ok(())
    }

    pub fn put_policy(&self, policy: Policy) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .policies
            .retain(|p| !(p.name == policy.name && p.namespace == policy.namespace));
        inner.policies.push(policy);
        Ok(())
    }
}

impl TaskStore for InMemoryStore {
    fn get_task(&self, key: &TaskKey) -> Result<Task, StoreError> {
        self.lock()?
            .tasks
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", key))
    }

    fn list_tasks(&self, namespace: &str) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .filter(|task| task.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut namespaces: Vec<String> = self
            .lock()?
            .tasks
            .keys()
            .map(|key| key.namespace.clone())
            .collect();
        namespaces.dedup();
        Ok(namespaces)
    }

    fn create_task(&self, task: &Task, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let key = task.key();
        let mut inner = self.lock()?;
        if inner.tasks.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                key: key.to_string(),
            });
        }
        let mut stored = task.clone();
        stored.metadata.resource_version = 1;
        stored.metadata.created_at = Some(now);
        inner.tasks.insert(key, stored.clone());
        Ok(stored)
    }

    fn update_task(&self, task: &Task) -> Result<Task, StoreError> {
        let key = task.key();
        let mut inner = self.lock()?;
        let stored = inner
            .tasks
            .get(&key)
            .ok_or_else(|| StoreError::not_found("task", &key))?;
        let next = prepare_update(stored, task)?;
        inner.tasks.insert(key, next.clone());
        Ok(next)
    }

    fn delete_task(&self, key: &TaskKey) -> Result<(), StoreError> {
        self.lock()?
            .tasks
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("task", key))
    }

    fn list_roles(&self, namespace: &str) -> Result<Vec<Role>, StoreError> {
        Ok(self
            .lock()?
            .roles
            .iter()
            .filter(|role| role.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    fn list_cluster_roles(&self) -> Result<Vec<Role>, StoreError> {
        Ok(self
            .lock()?
            .roles
            .iter()
            .filter(|role| role.namespace.is_none())
            .cloned()
            .collect())
    }

    fn list_policies(&self, namespace: &str) -> Result<Vec<Policy>, StoreError> {
        Ok(self
            .lock()?
            .policies
            .iter()
            .filter(|policy| policy.namespace == namespace)
            .cloned()
            .collect())
    }
}
