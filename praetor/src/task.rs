//! Task records: identity, submitter-owned spec, orchestrator-owned status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a task. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub namespace: String,
    pub name: String,
}

impl TaskKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Privilege rank of a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Legionary,
    Centurion,
    Tribune,
}

impl Tier {
    pub fn rank(self) -> u8 {
        match self {
            Tier::Legionary => 0,
            Tier::Centurion => 1,
            Tier::Tribune => 2,
        }
    }

    /// Tribunes and centurions run the planning runtime and may spawn children.
    pub fn is_agentic(self) -> bool {
        matches!(self, Tier::Tribune | Tier::Centurion)
    }

    /// Planning-loop iterations used when a task leaves `maxIterations` unset.
    pub fn default_max_iterations(self) -> u32 {
        match self {
            Tier::Tribune => 5,
            Tier::Centurion => 3,
            Tier::Legionary => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Legionary => "legionary",
            Tier::Centurion => "centurion",
            Tier::Tribune => "tribune",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Waiting,
    Retrying,
    Completed,
    Failed,
    BudgetExceeded,
    TimedOut,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Completed
                | Phase::Failed
                | Phase::BudgetExceeded
                | Phase::TimedOut
                | Phase::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Waiting => "Waiting",
            Phase::Retrying => "Retrying",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::BudgetExceeded => "BudgetExceeded",
            Phase::TimedOut => "TimedOut",
            Phase::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LLM endpoint used by the execution unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
}

/// Token and cost ceiling. Cost is a decimal string (e.g. `"0.50"`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<String>,
}

impl BudgetSpec {
    /// Declared cost ceiling, treating an empty string as unset.
    pub fn cost(&self) -> Option<&str> {
        self.max_cost_usd.as_deref().filter(|raw| !raw.trim().is_empty())
    }
}

/// Retry behavior for transient failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    /// Retries allowed after the first attempt (0 = no retry).
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

fn default_backoff_seconds() -> u64 {
    30
}

fn default_max_backoff_seconds() -> u64 {
    300
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff_seconds: default_backoff_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
        }
    }
}

/// Action taken when a task is judged stuck.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StuckAction {
    #[default]
    None,
    Warn,
    Kill,
    Escalate,
}

impl StuckAction {
    pub fn as_str(self) -> &'static str {
        match self {
            StuckAction::None => "none",
            StuckAction::Warn => "warn",
            StuckAction::Kill => "kill",
            StuckAction::Escalate => "escalate",
        }
    }
}

/// Optional stuck-detection thresholds; unset fields fall through to the next layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckDetectionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_diversity_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_repeated_prompts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_stale_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<StuckAction>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_detection: Option<StuckDetectionSpec>,
}

/// File delivered to the execution unit's inbox. `data` is base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub filename: String,
    pub data: String,
}

/// Submitter-owned description of the work. Write-once.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    #[serde(default)]
    pub tier: Tier,
    /// Name of the parent task in the same namespace. Absent on roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSpec>,
    /// Tree-wide ceiling. Only meaningful on roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_budget: Option<BudgetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_files: Vec<InputFile>,
}

impl TaskSpec {
    pub fn parent(&self) -> Option<&str> {
        self.parent_task_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Retries allowed after the first attempt, falling back to `default`.
    pub fn retry_max_attempts(&self, default: u32) -> u32 {
        self.retry.as_ref().map_or(default, |retry| retry.max_attempts)
    }

    pub fn stuck_overrides(&self) -> Option<&StuckDetectionSpec> {
        self.health.as_ref()?.stuck_detection.as_ref()
    }
}

/// Input/output token counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }

    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0
    }

    pub fn saturating_add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.saturating_add(other.input),
            output: self.output.saturating_add(other.output),
        }
    }
}

/// One execution attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Human-visible observation attached to a task (e.g. `Stuck`, `Escalated`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Orchestrator-owned observed state. Never written by the submitter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Identifier of the execution unit currently (or last) assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Usage summed over every attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<String>,
    /// Latest cumulative report of the current attempt. Cleared on every
    /// start, since a fresh unit counts from zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_tokens_used: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_cost_usd: Option<String>,
    /// Share of `tokens_used` already added to the root's hierarchy ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_charged_tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_charged_cost: Option<String>,
    /// Root-only: cumulative usage of the whole tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_tokens_used: Option<TokenUsage>,
    /// Root-only: cumulative cost of the whole tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_cost_used: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reincarnated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Artifact paths pushed through the report channel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl TaskStatus {
    /// Insert or replace a condition by kind.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }

    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

/// Retention metadata recorded from the retention signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    pub retain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub retained_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Bumped by the store on every accepted write.
    #[serde(default)]
    pub resource_version: u64,
    /// Stamped by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,
    /// Opt out of the result cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_cache: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub metadata: ObjectMeta,
    pub spec: TaskSpec,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn new(namespace: &str, name: &str, spec: TaskSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..ObjectMeta::default()
            },
            spec,
            status: TaskStatus::default(),
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
    }

    pub fn is_child_of(&self, parent: &Task) -> bool {
        self.metadata.namespace == parent.metadata.namespace
            && self.spec.parent() == Some(parent.name())
    }
}

/// Render a duration the way the status surface shows it (e.g. `1h2m3s`).
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (hours, rest) = (seconds / 3600, seconds % 3600);
    let (minutes, secs) = (rest / 60, rest % 60);
    match (hours, minutes) {
        (0, 0) => format!("{secs}s"),
        (0, _) => format!("{minutes}m{secs}s"),
        _ => format!("{hours}h{minutes}m{secs}s"),
    }
}
