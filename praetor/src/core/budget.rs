//! Token and cost ceilings for a single task and for a whole tree.
//!
//! Costs are persisted as decimal strings. Parsing happens here, and an
//! unparsable stored value is returned as [`CostParseError`] instead of being
//! read as zero.

use crate::error::CostParseError;
use crate::task::{BudgetSpec, Task, TaskStatus, TokenUsage};

/// Parse a decimal cost string. Rejects blanks, garbage, NaN and infinities.
pub fn parse_cost(raw: &str) -> Result<f64, CostParseError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| CostParseError {
            raw: raw.to_string(),
        })
}

/// Canonical persisted form: six fractional digits.
pub fn format_cost(cost: f64) -> String {
    format!("{cost:.6}")
}

/// Reason string when the task's own ceiling is reached, `None` otherwise.
///
/// A ceiling is reached at `used >= max` for tokens (input + output) and for
/// cost, each checked independently.
pub fn check_task_budget(
    budget: Option<&BudgetSpec>,
    usage: Option<TokenUsage>,
    cost: Option<&str>,
) -> Result<Option<String>, CostParseError> {
    match budget {
        Some(budget) => exhaustion("", budget, usage, cost),
        None => Ok(None),
    }
}

/// Reason string when a root's tree-wide ceiling is reached.
pub fn check_hierarchy(root: &Task) -> Result<Option<String>, CostParseError> {
    match &root.spec.hierarchy_budget {
        Some(budget) => exhaustion(
            "hierarchy ",
            budget,
            root.status.hierarchy_tokens_used,
            root.status.hierarchy_cost_used.as_deref(),
        ),
        None => Ok(None),
    }
}

fn exhaustion(
    label: &str,
    budget: &BudgetSpec,
    usage: Option<TokenUsage>,
    cost: Option<&str>,
) -> Result<Option<String>, CostParseError> {
    if let (Some(max), Some(usage)) = (budget.max_tokens, usage) {
        let total = usage.total();
        if i64::try_from(total).map_or(true, |total| total >= max) {
            return Ok(Some(format!(
                "{label}token budget exhausted: {total}/{max}"
            )));
        }
    }
    if let (Some(max_raw), Some(used_raw)) = (budget.cost(), cost.filter(|c| !c.is_empty())) {
        let max = parse_cost(max_raw)?;
        let used = parse_cost(used_raw)?;
        if used >= max {
            return Ok(Some(format!(
                "{label}cost budget exhausted: ${used:.4}/${max:.4}"
            )));
        }
    }
    Ok(None)
}

/// Add a usage delta to a root's tree-wide counters.
pub fn accumulate(
    root: &mut TaskStatus,
    delta: TokenUsage,
    delta_cost: f64,
) -> Result<(), CostParseError> {
    add_usage(&mut root.hierarchy_tokens_used, delta);
    add_cost(&mut root.hierarchy_cost_used, delta_cost)
}

pub fn add_usage(slot: &mut Option<TokenUsage>, delta: TokenUsage) {
    *slot = Some(slot.unwrap_or_default().saturating_add(delta));
}

/// Add `delta` to a persisted cost. An unset cost stays unset while nothing
/// is added.
pub fn add_cost(slot: &mut Option<String>, delta: f64) -> Result<(), CostParseError> {
    if delta > 0.0 || slot.is_some() {
        let existing = match slot.as_deref() {
            Some(raw) if !raw.is_empty() => parse_cost(raw)?,
            _ => 0.0,
        };
        *slot = Some(format_cost(existing + delta.max(0.0)));
    }
    Ok(())
}

/// Usage added between two cumulative readings. Never negative.
pub fn usage_delta(previous: Option<TokenUsage>, next: TokenUsage) -> TokenUsage {
    let previous = previous.unwrap_or_default();
    TokenUsage {
        input: next.input.saturating_sub(previous.input),
        output: next.output.saturating_sub(previous.output),
    }
}

/// Cost added between two cumulative readings. Never negative.
pub fn cost_delta(previous: Option<&str>, next: Option<&str>) -> Result<f64, CostParseError> {
    let parse = |raw: Option<&str>| match raw {
        Some(raw) if !raw.is_empty() => parse_cost(raw),
        _ => Ok(0.0),
    };
    Ok((parse(next)? - parse(previous)?).max(0.0))
}
