//! File-backed [`TaskStore`].
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<namespace>/tasks/<name>.json
//! <root>/<namespace>/roles/<name>.json
//! <root>/<namespace>/policies/<name>.json
//! <root>/_cluster/roles/<name>.json
//! ```
//!
//! Documents are schema-checked on every read. Writes go through a temp file
//! and a rename, and task updates compare `resourceVersion` against the copy
//! on disk.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::io::schema::{ResourceKind, SchemaRegistry};
use crate::io::store::{TaskStore, prepare_update};
use crate::policy::Policy;
use crate::role::Role;
use crate::task::{Task, TaskKey};

const CLUSTER_DIR: &str = "_cluster";

/// Write `contents` to `path` via a sibling temp file and a rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Read a standalone task document (e.g. a manifest passed on the command line).
pub fn read_task_document(schemas: &SchemaRegistry, path: &Path) -> Result<Task> {
    read_document(schemas, ResourceKind::Task, path)
}

fn read_document<T: DeserializeOwned>(
    schemas: &SchemaRegistry,
    kind: ResourceKind,
    path: &Path,
) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    schemas
        .validate(kind, &value)
        .with_context(|| format!("validate {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("deserialize {}", path.display()))
}

fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(document).context("serialize document")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

/// Store rooted at a directory. One process should own a root at a time;
/// writers inside the process are serialized by an internal lock.
pub struct FileStore {
    root: PathBuf,
    schemas: SchemaRegistry,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("create store root {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            schemas: SchemaRegistry::new()?,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn put_role(&self, role: &Role) -> Result<()> {
        let (namespace, kind) = match role.namespace.as_deref() {
            Some(namespace) => (namespace, ResourceKind::Role),
            None => (CLUSTER_DIR, ResourceKind::ClusterRole),
        };
        self.schemas
            .validate(kind, &serde_json::to_value(role)?)
            .with_context(|| format!("role {}", role.name))?;
        write_document(&self.document_path(namespace, kind, &role.name), role)
    }

    pub fn put_policy(&self, policy: &Policy) -> Result<()> {
        self.schemas
            .validate(ResourceKind::Policy, &serde_json::to_value(policy)?)
            .with_context(|| format!("policy {}", policy.name))?;
        write_document(
            &self.document_path(&policy.namespace, ResourceKind::Policy, &policy.name),
            policy,
        )
    }

    fn document_path(&self, namespace: &str, kind: ResourceKind, name: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(kind.dir_name())
            .join(format!("{name}.json"))
    }

    fn task_path(&self, key: &TaskKey) -> Result<PathBuf, StoreError> {
        for part in [&key.namespace, &key.name] {
            if part.is_empty() || part.starts_with('.') || part.contains(['/', '\\']) {
                return Err(StoreError::Backend(format!("invalid task key {key}")));
            }
        }
        Ok(self.document_path(&key.namespace, ResourceKind::Task, &key.name))
    }

    fn list_documents<T: DeserializeOwned>(
        &self,
        namespace: &str,
        kind: ResourceKind,
    ) -> Result<Vec<T>> {
        let dir = self.root.join(namespace).join(kind.dir_name());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        paths
            .iter()
            .map(|path| read_document(&self.schemas, kind, path))
            .collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Backend("store write lock poisoned".to_string()))
    }
}

impl TaskStore for FileStore {
    fn get_task(&self, key: &TaskKey) -> Result<Task, StoreError> {
        let path = self.task_path(key)?;
        if !path.exists() {
            return Err(StoreError::not_found("task", key));
        }
        read_document(&self.schemas, ResourceKind::Task, &path).map_err(backend)
    }

    fn list_tasks(&self, namespace: &str) -> Result<Vec<Task>, StoreError> {
        self.list_documents(namespace, ResourceKind::Task)
            .map_err(backend)
    }

    fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("read {}", self.root.display()))
            .map_err(backend)?;
        let mut namespaces = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(['_', '.']) || !entry.path().join("tasks").is_dir() {
                continue;
            }
            namespaces.push(name);
        }
        namespaces.sort();
        Ok(namespaces)
    }

    #[instrument(skip_all, fields(task = %task.key()))]
    fn create_task(&self, task: &Task, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let key = task.key();
        let path = self.task_path(&key)?;
        let _guard = self.lock()?;
        if path.exists() {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                key: key.to_string(),
            });
        }
        let mut stored = task.clone();
        stored.metadata.resource_version = 1;
        stored.metadata.created_at = Some(now);
        write_document(&path, &stored).map_err(backend)?;
        debug!("task created");
        Ok(stored)
    }

    #[instrument(skip_all, fields(task = %task.key(), version = task.metadata.resource_version))]
    fn update_task(&self, task: &Task) -> Result<Task, StoreError> {
        let key = task.key();
        let path = self.task_path(&key)?;
        let _guard = self.lock()?;
        if !path.exists() {
            return Err(StoreError::not_found("task", &key));
        }
        let stored: Task =
            read_document(&self.schemas, ResourceKind::Task, &path).map_err(backend)?;
        let next = prepare_update(&stored, task)?;
        write_document(&path, &next).map_err(backend)?;
        debug!(new_version = next.metadata.resource_version, "task updated");
        Ok(next)
    }

    fn delete_task(&self, key: &TaskKey) -> Result<(), StoreError> {
        let path = self.task_path(key)?;
        let _guard = self.lock()?;
        if !path.exists() {
            return Err(StoreError::not_found("task", key));
        }
        fs::remove_file(&path)
            .with_context(|| format!("remove {}", path.display()))
            .map_err(backend)
    }

    fn list_roles(&self, namespace: &str) -> Result<Vec<Role>, StoreError> {
        let mut roles: Vec<Role> = self
            .list_documents(namespace, ResourceKind::Role)
            .map_err(backend)?;
        for role in &mut roles {
            role.namespace = Some(namespace.to_string());
        }
        Ok(roles)
    }

    fn list_cluster_roles(&self) -> Result<Vec<Role>, StoreError> {
        let mut roles: Vec<Role> = self
            .list_documents(CLUSTER_DIR, ResourceKind::ClusterRole)
            .map_err(backend)?;
        for role in &mut roles {
            role.namespace = None;
        }
        Ok(roles)
    }

    fn list_policies(&self, namespace: &str) -> Result<Vec<Policy>, StoreError> {
        let policies: Vec<Policy> = self
            .list_documents(namespace, ResourceKind::Policy)
            .map_err(backend)?;
        policies
            .into_iter()
            .map(|policy| {
                if policy.namespace == namespace {
                    Ok(policy)
                } else {
                    Err(backend(anyhow!(
                        "policy {} declares namespace {} but is stored under {namespace}",
                        policy.name,
                        policy.namespace
                    )))
                }
            })
            .collect()
    }
}
