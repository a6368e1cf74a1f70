//! Orchestrator configuration stored as `config.toml` at the store root.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::pricing::PriceTable;
use crate::core::stuck::StuckThresholds;
use crate::task::RetrySpec;

/// Orchestrator configuration (TOML).
///
/// Edited by operators. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Timeout applied to tasks that declare none.
    pub default_timeout_secs: i64,

    /// Image used when a task names none (also matched against policies).
    pub default_image: String,

    /// Retry policy for tasks that declare none.
    pub retry: RetrySpec,

    /// Namespace-level stuck-detection defaults.
    pub stuck_detection: StuckThresholds,

    pub requeue: RequeueConfig,

    /// Optimistic-concurrency retries before a write gives up.
    pub conflict_retry_limit: u32,

    /// Longest `parentTaskId` chain followed when looking for a root.
    pub max_hierarchy_depth: usize,

    pub result_cache: ResultCacheConfig,

    /// Per-token prices keyed by model name.
    pub prices: PriceTable,
}

/// Suggested delays before a task is looked at again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequeueConfig {
    pub running_secs: u64,
    pub waiting_secs: u64,
    pub pending_secs: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            running_secs: 5,
            waiting_secs: 30,
            pending_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResultCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 10 * 60,
            max_entries: 1000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            default_image: "ghcr.io/praetor/agent:latest".to_string(),
            retry: RetrySpec::default(),
            stuck_detection: StuckThresholds::default(),
            requeue: RequeueConfig::default(),
            conflict_retry_limit: 5,
            max_hierarchy_depth: 10,
            result_cache: ResultCacheConfig::default(),
            prices: PriceTable::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_secs <= 0 {
            return Err(anyhow!("default_timeout_secs must be > 0"));
        }
        if self.default_image.trim().is_empty() {
            return Err(anyhow!("default_image must be non-empty"));
        }
        if self.retry.backoff_seconds == 0 {
            return Err(anyhow!("retry.backoff_seconds must be > 0"));
        }
        if self.retry.max_backoff_seconds < self.retry.backoff_seconds {
            return Err(anyhow!(
                "retry.max_backoff_seconds must be >= retry.backoff_seconds"
            ));
        }
        if !(0.0..=1.0).contains(&self.stuck_detection.tool_diversity_min) {
            return Err(anyhow!("stuck_detection.tool_diversity_min must be in [0, 1]"));
        }
        if self.conflict_retry_limit == 0 {
            return Err(anyhow!("conflict_retry_limit must be > 0"));
        }
        if self.max_hierarchy_depth == 0 {
            return Err(anyhow!("max_hierarchy_depth must be > 0"));
        }
        if self.result_cache.enabled && self.result_cache.max_entries == 0 {
            return Err(anyhow!("result_cache.max_entries must be > 0 when enabled"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::file_store::write_atomic(path, &buf)
}
