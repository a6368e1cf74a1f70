//! Compile-time registry of resource kinds and their JSON Schemas.
//!
//! Every document read from disk is checked against its kind's schema before
//! it is deserialized, so malformed records fail with field-level messages.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;

const TASK_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/task.schema.json"
));
const ROLE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/role.schema.json"
));
const POLICY_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/policy.schema.json"
));

/// Kinds of persisted resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Task,
    Role,
    ClusterRole,
    Policy,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Task,
        ResourceKind::Role,
        ResourceKind::ClusterRole,
        ResourceKind::Policy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Task => "Task",
            ResourceKind::Role => "Role",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::Policy => "Policy",
        }
    }

    /// Embedded schema source. Cluster roles share the role schema.
    pub fn schema_source(self) -> &'static str {
        match self {
            ResourceKind::Task => TASK_SCHEMA,
            ResourceKind::Role | ResourceKind::ClusterRole => ROLE_SCHEMA,
            ResourceKind::Policy => POLICY_SCHEMA,
        }
    }

    /// Directory name holding documents of this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            ResourceKind::Task => "tasks",
            ResourceKind::Role | ResourceKind::ClusterRole => "roles",
            ResourceKind::Policy => "policies",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled validators for every [`ResourceKind`].
pub struct SchemaRegistry {
    validators: HashMap<ResourceKind, Validator>,
}

impl SchemaRegistry {
    pub fn new() -> Result<Self> {
        let mut validators = HashMap::new();
        for kind in ResourceKind::ALL {
            let schema: Value = serde_json::from_str(kind.schema_source())
                .map_err(|err| anyhow!("parse {kind} schema: {err}"))?;
            let compiled =
                validator_for(&schema).map_err(|err| anyhow!("invalid {kind} schema: {err}"))?;
            validators.insert(kind, compiled);
        }
        Ok(Self { validators })
    }

    /// Check `document` against the schema for `kind`, reporting every error.
    pub fn validate(&self, kind: ResourceKind, document: &Value) -> Result<()> {
        let validator = self
            .validators
            .get(&kind)
            .ok_or_else(|| anyhow!("no schema registered for {kind}"))?;
        if validator.is_valid(document) {
            return Ok(());
        }
        let messages = validator
            .iter_errors(document)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        Err(anyhow!(
            "{kind} schema validation failed: {}",
            messages.join("; ")
        ))
    }
}
