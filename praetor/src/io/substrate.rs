//! Execution substrate abstraction.
//!
//! The [`ExecutionSubstrate`] trait decouples the reconciler from whatever
//! actually runs an agent. The orchestrator only needs a unit identifier back;
//! exit status and usage arrive later through the reconciler's observation
//! entry points. Tests use scripted substrates that start nothing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::SubstrateError;
use crate::io::file_store::write_atomic;
use crate::policy::EgressRule;
use crate::task::{InputFile, ModelSpec, TaskKey, Tier};

/// Everything a substrate needs to run one attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub task: TaskKey,
    /// Attempt number this unit serves (1-indexed).
    pub attempt: u32,
    pub tier: Tier,
    pub image: String,
    pub model: ModelSpec,
    /// Rendered role rules, flavor, and runtime instructions.
    pub system_prompt: String,
    pub prompt: String,
    /// Declared capabilities plus the tier's implicit grants.
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub input_files: Vec<InputFile>,
    pub timeout_secs: i64,
    pub max_iterations: u32,
    pub egress: Vec<EgressRule>,
    pub env: BTreeMap<String, String>,
}

impl ExecRequest {
    /// Deterministic unit name for this attempt.
    pub fn unit_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.task.namespace, self.task.name, self.attempt
        )
    }
}

/// Runs execution units.
pub trait ExecutionSubstrate: Send + Sync {
    /// Start a unit for `request` and return its identifier.
    fn start(&self, request: &ExecRequest) -> Result<String, SubstrateError>;

    /// Best-effort forced termination. Unknown units are not an error.
    fn terminate(&self, unit_id: &str) -> Result<()>;
}

/// Substrate that hands work to an external runner through a spool directory.
///
/// `start` writes `<dir>/<unit>.json`; `terminate` drops `<dir>/<unit>.terminate`.
pub struct SpoolSubstrate {
    dir: PathBuf,
}

impl SpoolSubstrate {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn request_path(&self, unit_id: &str) -> PathBuf {
        self.dir.join(format!("{unit_id}.json"))
    }
}

impl ExecutionSubstrate for SpoolSubstrate {
    #[instrument(skip_all, fields(task = %request.task, attempt = request.attempt))]
    fn start(&self, request: &ExecRequest) -> Result<String, SubstrateError> {
        let unit_id = request.unit_name();
        let mut buf = serde_json::to_string_pretty(request)
            .map_err(|err| SubstrateError::Fatal(format!("serialize request: {err}")))?;
        buf.push('\n');
        write_atomic(&self.request_path(&unit_id), &buf)
            .map_err(|err| SubstrateError::Retryable(format!("{err:#}")))?;
        info!(unit = %unit_id, "execution request spooled");
        Ok(unit_id)
    }

    fn terminate(&self, unit_id: &str) -> Result<()> {
        let marker = self.dir.join(format!("{unit_id}.terminate"));
        write_atomic(&marker, "")
            .with_context(|| format!("write terminate marker for {unit_id}"))?;
        info!(unit = %unit_id, "termination requested");
        Ok(())
    }
}
