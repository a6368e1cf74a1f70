//! Stuck detection over liveness signals.
//!
//! Thresholds cascade: namespace default, then role override, then task
//! override. The most specific layer that sets a field wins; layers are not
//! otherwise merged.

use serde::{Deserialize, Serialize};

use crate::task::{StuckAction, StuckDetectionSpec};

const DIVERSITY_WEIGHT: f64 = 0.40;
const REPETITION_WEIGHT: f64 = 0.35;
const STALENESS_WEIGHT: f64 = 0.25;
const STUCK_THRESHOLD: f64 = 0.5;

/// Fully resolved thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckThresholds {
    pub enabled: bool,
    pub tool_diversity_min: f64,
    pub max_repeated_prompts: u32,
    pub status_stale_minutes: u32,
    pub action: StuckAction,
}

impl Default for StuckThresholds {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_diversity_min: 0.3,
            max_repeated_prompts: 3,
            status_stale_minutes: 5,
            action: StuckAction::Warn,
        }
    }
}

/// Apply role then task overrides on top of the namespace defaults.
pub fn resolve_thresholds(
    defaults: &StuckThresholds,
    role: Option<&StuckDetectionSpec>,
    task: Option<&StuckDetectionSpec>,
) -> StuckThresholds {
    let mut resolved = *defaults;
    for layer in [role, task].into_iter().flatten() {
        if let Some(min) = layer.tool_diversity_min {
            resolved.tool_diversity_min = min;
        }
        if let Some(max) = layer.max_repeated_prompts {
            resolved.max_repeated_prompts = max;
        }
        if let Some(minutes) = layer.status_stale_minutes {
            resolved.status_stale_minutes = minutes;
        }
        if let Some(action) = layer.action {
            resolved.action = action;
        }
    }
    resolved
}

/// Observed liveness signals. Gathering them is the caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StuckSignals {
    /// Unique tools / total tool calls, in `[0, 1]`.
    pub tool_diversity: f64,
    /// Highest count of one identical prompt.
    pub repeated_prompts: u32,
    /// Minutes since the last progress update.
    pub stale_minutes: f64,
}

impl StuckSignals {
    /// Diversity over a tool-call trace; too few calls reads as healthy.
    pub fn diversity_of<S: AsRef<str>>(calls: &[S]) -> f64 {
        if calls.len() <= 2 {
            return 1.0;
        }
        let unique: std::collections::BTreeSet<&str> =
            calls.iter().map(AsRef::as_ref).collect();
        unique.len() as f64 / calls.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StuckVerdict {
    /// `None` when healthy or when detection is disabled.
    pub action: StuckAction,
    /// Weighted penalty in `[0, 1]`.
    pub score: f64,
    pub reason: String,
}

impl StuckVerdict {
    fn healthy(score: f64) -> Self {
        Self {
            action: StuckAction::None,
            score,
            reason: String::new(),
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.action != StuckAction::None
    }
}

/// Score the signals and return the configured action when stuck.
pub fn evaluate(signals: &StuckSignals, thresholds: &StuckThresholds) -> StuckVerdict {
    if !thresholds.enabled {
        return StuckVerdict::healthy(0.0);
    }

    let diversity_penalty = if thresholds.tool_diversity_min > 0.0
        && signals.tool_diversity < thresholds.tool_diversity_min
    {
        (thresholds.tool_diversity_min - signals.tool_diversity) / thresholds.tool_diversity_min
    } else {
        0.0
    };

    let max_repeats = thresholds.max_repeated_prompts;
    let repetition_penalty = if max_repeats > 0 && signals.repeated_prompts > max_repeats {
        (f64::from(signals.repeated_prompts - max_repeats) / f64::from(max_repeats)).min(1.0)
    } else {
        0.0
    };

    let stale_limit = f64::from(thresholds.status_stale_minutes);
    let staleness_penalty = if stale_limit > 0.0 && signals.stale_minutes > stale_limit {
        ((signals.stale_minutes - stale_limit) / stale_limit).min(1.0)
    } else {
        0.0
    };

    let score = DIVERSITY_WEIGHT * diversity_penalty
        + REPETITION_WEIGHT * repetition_penalty
        + STALENESS_WEIGHT * staleness_penalty;

    if score < STUCK_THRESHOLD {
        return StuckVerdict::healthy(score);
    }

    let mut reasons = Vec::new();
    if diversity_penalty > 0.0 {
        reasons.push(format!(
            "low tool diversity ({:.2} < {:.2})",
            signals.tool_diversity, thresholds.tool_diversity_min
        ));
    }
    if repetition_penalty > 0.0 {
        reasons.push(format!(
            "repeated prompts ({} > {})",
            signals.repeated_prompts, max_repeats
        ));
    }
    if staleness_penalty > 0.0 {
        reasons.push(format!(
            "stale progress ({:.0}m > {}m)",
            signals.stale_minutes, thresholds.status_stale_minutes
        ));
    }

    StuckVerdict {
        action: thresholds.action,
        score,
        reason: reasons.join("; "),
    }
}
