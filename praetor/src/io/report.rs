//! Report channel payloads and runtime output parsing.
//!
//! An execution unit pushes [`Report`]s while it runs; the latest one is
//! authoritative for output and token usage. When a report omits fields, they
//! are recovered from the runtime's output text: `Tokens: in=<n> out=<m>`
//! lines, a `[result-begin]` ... `[result-end]` block, and a JSON
//! `"status": "waiting"` or `"status": "budget_exceeded"` marker.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::stuck::StuckSignals;
use crate::task::TokenUsage;

static TOKENS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tokens: in=(\d+) out=(\d+)").expect("tokens regex"));
static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""status":\s*"(waiting|budget_exceeded)""#).expect("status regex")
});
static TOOL_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tool call: (\w+)\(").expect("tool call regex"));
static PROMPT_HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Prompt hash: ([a-f0-9]+)").expect("prompt hash regex"));

const RESULT_BEGIN: &str = "[result-begin]";
const RESULT_END: &str = "[result-end]";

/// One push from a running unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Set when the unit has exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Substrate-level reason accompanying an exit (e.g. `OOMKilled`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Report {
    /// Fill gaps from the raw output text and reduce the output to the
    /// delimited result when one is present.
    pub fn normalized(mut self) -> Self {
        if let Some(raw) = self.output.take() {
            if self.tokens.is_none() {
                self.tokens = parse_token_line(&raw);
            }
            self.output = Some(extract_result(&raw).unwrap_or_else(|| raw.trim().to_string()));
        }
        self
    }

    /// Status marker in the output, if the runtime emitted one.
    pub fn marker(&self) -> Option<StatusMarker> {
        self.output.as_deref().and_then(detect_marker)
    }
}

/// Self-reported runtime state embedded in output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMarker {
    /// The unit checkpointed to wait on its children.
    Waiting,
    /// The runtime stopped because it hit its budget.
    BudgetExceeded,
}

/// Last `Tokens: in=<n> out=<m>` line in `text`.
pub fn parse_token_line(text: &str) -> Option<TokenUsage> {
    let caps = TOKENS_RE.captures_iter(text).last()?;
    let input = caps.get(1)?.as_str().parse().ok()?;
    let output = caps.get(2)?.as_str().parse().ok()?;
    Some(TokenUsage::new(input, output))
}

/// Text between the last `[result-begin]` and the `[result-end]` after it.
pub fn extract_result(text: &str) -> Option<String> {
    let begin = text.rfind(RESULT_BEGIN)? + RESULT_BEGIN.len();
    let end = text[begin..].find(RESULT_END)? + begin;
    Some(text[begin..end].trim().to_string())
}

pub fn detect_marker(text: &str) -> Option<StatusMarker> {
    let caps = STATUS_RE.captures_iter(text).last()?;
    match caps.get(1)?.as_str() {
        "waiting" => Some(StatusMarker::Waiting),
        "budget_exceeded" => Some(StatusMarker::BudgetExceeded),
        _ => None,
    }
}

/// Liveness signals from a unit's activity log.
///
/// `last_progress` is the last time the unit reported anything.
pub fn signals_from_log(log: &str, last_progress: DateTime<Utc>, now: DateTime<Utc>) -> StuckSignals {
    let calls: Vec<&str> = TOOL_CALL_RE
        .captures_iter(log)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    let mut counts: HashMap<&str, u32> = HashMap::new();
    for caps in PROMPT_HASH_RE.captures_iter(log) {
        if let Some(hash) = caps.get(1) {
            *counts.entry(hash.as_str()).or_default() += 1;
        }
    }

    let stale_seconds = (now - last_progress).num_seconds().max(0);
    StuckSignals {
        tool_diversity: StuckSignals::diversity_of(&calls),
        repeated_prompts: counts.values().copied().max().unwrap_or(0),
        stale_minutes: stale_seconds as f64 / 60.0,
    }
}
