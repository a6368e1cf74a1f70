//! Test-only helpers: deterministic task builders, a fixed clock, a
//! scripted execution substrate, throwaway file stores, and a store wrapper
//! that loses write races on demand.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::clock::Clock;
use crate::error::{StoreError, SubstrateError};
use crate::io::file_store::FileStore;
use crate::io::store::TaskStore;
use crate::io::substrate::{ExecRequest, ExecutionSubstrate};
use crate::policy::Policy;
use crate::role::Role;
use crate::task::{ModelSpec, Task, TaskKey, TaskSpec};

/// Fixed base instant plus `seconds`.
pub fn at(seconds: i64) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    base + Duration::seconds(seconds)
}

/// Root legionary task in namespace `default` with a model and a prompt.
pub fn task(name: &str) -> Task {
    Task::new(
        "default",
        name,
        TaskSpec {
            prompt: format!("{name} prompt"),
            model: Some(ModelSpec {
                name: "claude-sonnet".to_string(),
                endpoint: "http://llm.local".to_string(),
            }),
            ..TaskSpec::default()
        },
    )
}

/// Like [`task`], with `parentTaskId` set.
pub fn child(name: &str, parent: &str) -> Task {
    let mut task = task(name);
    task.spec.parent_task_id = Some(parent.to_string());
    task
}

/// File store rooted in a fresh temp directory. Keep the guard alive.
pub fn temp_store() -> Result<(tempfile::TempDir, FileStore)> {
    let dir = tempfile::tempdir()?;
    let store = FileStore::open(&dir.path().join("store"))?;
    Ok((dir, store))
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, seconds: i64) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += Duration::seconds(seconds);
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |guard| *guard)
    }
}

/// Substrate that returns scripted start outcomes and records every call.
///
/// With no scripted outcome left, `start` succeeds with
/// [`ExecRequest::unit_name`].
#[derive(Debug, Default)]
pub struct ScriptedSubstrate {
    outcomes: Mutex<VecDeque<Result<String, SubstrateError>>>,
    started: Mutex<Vec<ExecRequest>>,
    terminated: Mutex<Vec<String>>,
}

impl ScriptedSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next `start` call.
    pub fn push_outcome(&self, outcome: Result<String, SubstrateError>) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(outcome);
        }
    }

    pub fn started(&self) -> Vec<ExecRequest> {
        self.started
            .lock()
            .map(|started| started.clone())
            .unwrap_or_default()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated
            .lock()
            .map(|terminated| terminated.clone())
            .unwrap_or_default()
    }
}

impl ExecutionSubstrate for ScriptedSubstrate {
    fn start(&self, request: &ExecRequest) -> Result<String, SubstrateError> {
        if let Ok(mut started) = self.started.lock() {
            started.push(request.clone());
        }
        let scripted = self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front());
        scripted.unwrap_or_else(|| Ok(request.unit_name()))
    }

    fn terminate(&self, unit_id: &str) -> Result<()> {
        if let Ok(mut terminated) = self.terminated.lock() {
            terminated.push(unit_id.to_string());
        }
        Ok(())
    }
}

/// Store wrapper whose updates to chosen tasks fail with a version conflict,
/// as if another writer always got there first.
pub struct ContendedStore<S> {
    inner: S,
    contended: Mutex<BTreeMap<TaskKey, u32>>,
}

impl<S: TaskStore> ContendedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            contended: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reject the next `times` updates of `key`.
    pub fn contend(&self, key: &TaskKey, times: u32) {
        if let Ok(mut contended) = self.contended.lock() {
            contended.insert(key.clone(), times);
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn lose_race(&self, key: &TaskKey) -> bool {
        let Ok(mut contended) = self.contended.lock() else {
            return false;
        };
        match contended.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl<S: TaskStore> TaskStore for ContendedStore<S> {
    fn get_task(&self, key: &TaskKey) -> Result<Task, StoreError> {
        self.inner.get_task(key)
    }

    fn list_tasks(&self, namespace: &str) -> Result<Vec<Task>, StoreError> {
        self.inner.list_tasks(namespace)
    }

    fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_namespaces()
    }

    fn create_task(&self, task: &Task, now: DateTime<Utc>) -> Result<Task, StoreError> {
        self.inner.create_task(task, now)
    }

    fn update_task(&self, task: &Task) -> Result<Task, StoreError> {
        let key = task.key();
        if self.lose_race(&key) {
            let version = task.metadata.resource_version;
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: version,
                found: version + 1,
            });
        }
        self.inner.update_task(task)
    }

    fn delete_task(&self, key: &TaskKey) -> Result<(), StoreError> {
        self.inner.delete_task(key)
    }

    fn list_roles(&self, namespace: &str) -> Result<Vec<Role>, StoreError> {
        self.inner.list_roles(namespace)
    }

    fn list_cluster_roles(&self) -> Result<Vec<Role>, StoreError> {
        self.inner.list_cluster_roles()
    }

    fn list_policies(&self, namespace: &str) -> Result<Vec<Policy>, StoreError> {
        self.inner.list_policies(namespace)
    }
}
