//! Prometheus metrics for task lifecycle observability.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `praetor_tasks_total` | Counter | `phase`, `namespace` |
//! | `praetor_tasks_active` | Gauge | `namespace` |
//! | `praetor_task_duration_seconds` | Histogram | |
//! | `praetor_task_cost_usd` | Histogram | |
//! | `praetor_budget_exceeded_total` | Counter | `namespace` |
//! | `praetor_stuck_detected_total` | Counter | `action`, `namespace` |
//! | `praetor_task_tool_diversity` | Gauge | `namespace`, `task` |
//!
//! The reconciler feeds phase changes and stuck verdicts in as they happen.
//! The active gauge is level-triggered: it is set from a store listing at the
//! end of every pass.

use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder, exponential_buckets,
};
use thiserror::Error;

use crate::core::budget::parse_cost;
use crate::core::stuck::{StuckSignals, StuckVerdict};
use crate::core::types::TransitionSummary;
use crate::task::{Phase, Task};

/// Cost buckets in USD.
pub const COST_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0];

/// Label values longer than this are cut at a char boundary.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Task metrics registered in their own registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    tasks_total: IntCounterVec,
    tasks_active: IntGaugeVec,
    task_duration: Histogram,
    task_cost: Histogram,
    budget_exceeded_total: IntCounterVec,
    stuck_detected_total: IntCounterVec,
    tool_diversity: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new("praetor_tasks_total", "Phase changes by target phase and namespace"),
            &["phase", "namespace"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let tasks_active = IntGaugeVec::new(
            Opts::new("praetor_tasks_active", "Running tasks by namespace"),
            &["namespace"],
        )?;
        registry.register(Box::new(tasks_active.clone()))?;

        // 1s to about 4.5h.
        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "praetor_task_duration_seconds",
                "Duration of finished tasks in seconds",
            )
            .buckets(exponential_buckets(1.0, 2.0, 15)?),
        )?;
        registry.register(Box::new(task_duration.clone()))?;

        let task_cost = Histogram::with_opts(
            HistogramOpts::new("praetor_task_cost_usd", "Estimated cost of finished tasks")
                .buckets(COST_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(task_cost.clone()))?;

        let budget_exceeded_total = IntCounterVec::new(
            Opts::new(
                "praetor_budget_exceeded_total",
                "Tasks stopped by their own or their tree's budget",
            ),
            &["namespace"],
        )?;
        registry.register(Box::new(budget_exceeded_total.clone()))?;

        let stuck_detected_total = IntCounterVec::new(
            Opts::new(
                "praetor_stuck_detected_total",
                "Stuck verdicts by action and namespace",
            ),
            &["action", "namespace"],
        )?;
        registry.register(Box::new(stuck_detected_total.clone()))?;

        let tool_diversity = GaugeVec::new(
            Opts::new(
                "praetor_task_tool_diversity",
                "Latest tool diversity score (unique/total) of running tasks",
            ),
            &["namespace", "task"],
        )?;
        registry.register(Box::new(tool_diversity.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            tasks_active,
            task_duration,
            task_cost,
            budget_exceeded_total,
            stuck_detected_total,
            tool_diversity,
        })
    }

    /// Count a persisted phase change. Finished tasks also feed the duration
    /// and cost histograms.
    pub fn phase_changed(&self, task: &Task, summary: &TransitionSummary) {
        if !summary.changed() {
            return;
        }
        let namespace = truncate_label(&task.metadata.namespace);
        self.tasks_total
            .with_label_values(&[summary.to.as_str(), namespace])
            .inc();
        if summary.to == Phase::BudgetExceeded {
            self.budget_exceeded_total.with_label_values(&[namespace]).inc();
        }
        if !summary.to.is_terminal() {
            return;
        }
        if let (Some(started), Some(completed)) = (task.status.started_at, task.status.completed_at) {
            let millis = (completed - started).num_milliseconds().max(0);
            self.task_duration.observe(millis as f64 / 1000.0);
        }
        if let Some(cost) = task
            .status
            .estimated_cost_usd
            .as_deref()
            .and_then(|raw| parse_cost(raw).ok())
        {
            self.task_cost.observe(cost);
        }
    }

    /// Record the signals behind a verdict, and the verdict when it fired.
    pub fn stuck_checked(&self, task: &Task, signals: &StuckSignals, verdict: &StuckVerdict) {
        let namespace = truncate_label(&task.metadata.namespace);
        self.tool_diversity
            .with_label_values(&[namespace, truncate_label(task.name())])
            .set(signals.tool_diversity);
        if verdict.is_stuck() {
            self.stuck_detected_total
                .with_label_values(&[verdict.action.as_str(), namespace])
                .inc();
        }
    }

    /// Set the running count of `namespace`.
    pub fn set_active(&self, namespace: &str, running: usize) {
        self.tasks_active
            .with_label_values(&[truncate_label(namespace)])
            .set(i64::try_from(running).unwrap_or(i64::MAX));
    }

    pub fn phase_count(&self, phase: Phase, namespace: &str) -> u64 {
        self.tasks_total
            .with_label_values(&[phase.as_str(), truncate_label(namespace)])
            .get()
    }

    pub fn stuck_count(&self, action: &str, namespace: &str) -> u64 {
        self.stuck_detected_total
            .with_label_values(&[action, truncate_label(namespace)])
            .get()
    }

    /// All metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| MetricsError::Encoding(err.to_string()))?;
        String::from_utf8(buffer).map_err(|err| MetricsError::Encoding(err.to_string()))
    }
}

fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(index, _)| index)
        .take_while(|&index| index <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
