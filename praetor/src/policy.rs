//! Namespace-wide governance applied to every task in a namespace.

use serde::{Deserialize, Serialize};

use crate::task::{BudgetSpec, Tier};

/// One allowed egress destination. Empty `ports` allows every port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    pub host: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Whitelist. Empty means every capability not denied is allowed.
    #[serde(default)]
    pub allowed_capabilities: Vec<String>,
    /// Blacklist. Takes precedence over `allowed_capabilities`.
    #[serde(default)]
    pub denied_capabilities: Vec<String>,
    /// Glob patterns (`*`, `?`) matched against the task image.
    #[serde(default)]
    pub allowed_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<BudgetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tier: Option<Tier>,
    #[serde(default)]
    pub egress_allowlist: Vec<EgressRule>,
    /// Cap on Running tasks in the namespace. 0 or unset disables the cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub namespace: String,
    pub spec: PolicySpec,
}
