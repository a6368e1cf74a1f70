//! Reconciliation driver.
//!
//! Joins the pure lifecycle rules in [`crate::core`] to the store and the
//! execution substrate. Every change to a task is a versioned
//! read-modify-write, and side effects (terminating units, notifying parents)
//! run only after the write that calls for them has landed.
//!
//! The driver is level-triggered: [`Reconciler::reconcile`] looks at the
//! current record and does what its phase calls for, so replaying it is
//! harmless. Things that happen outside the store (unit exits, reports,
//! liveness signals, operator requests) arrive as [`Observation`]s.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::core::budget::{check_hierarchy, check_task_budget};
use crate::core::children::{pending_children, register_pending, resolve_pending};
use crate::core::classifier::classify_failure;
use crate::core::hierarchy::{ancestors, find_root, members_top_down, task_path};
use crate::core::invariants::check_status_invariants;
use crate::core::policy_validator::{check_policies, concurrency_limit_reached, validate_task};
use crate::core::roles::resolve_role;
use crate::core::selector::{effective_timeout, next_timer, reconcile_order, retry_due, timed_out};
use crate::core::state_machine::{TransitionContext, apply_event, can_transition};
use crate::core::stuck::{StuckSignals, StuckVerdict, evaluate, resolve_thresholds};
use crate::core::types::{Effect, TaskEvent, TransitionSummary, Violation};
use crate::error::{AdmissionRejected, LedgerError, StoreError, SubstrateError, TransitionError};
use crate::io::config::OrchestratorConfig;
use crate::io::prompt::{PromptEngine, RequestInputs};
use crate::io::report::{Report, StatusMarker, signals_from_log};
use crate::io::result_cache::{CachedResult, ResultCache, cache_key};
use crate::io::store::{TaskStore, update_with_retry};
use crate::io::substrate::ExecutionSubstrate;
use crate::ledger::{BudgetLedger, outstanding_charge, record_report};
use crate::metrics::Metrics;
use crate::policy::Policy;
use crate::role::Role;
use crate::task::{Phase, Retention, Task, TaskKey, TaskStatus};

/// What the caller should do with a task after one reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing is scheduled; the next observation wakes the task.
    Done,
    /// Look at the task again after this many seconds.
    Requeue { after_secs: u64 },
    /// The task no longer exists.
    Gone,
}

/// An execution unit stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitExit {
    pub unit_id: String,
    /// `None` when the unit vanished without an exit status.
    pub exit_code: Option<i32>,
    /// Substrate reason such as `OOMKilled`.
    pub reason: Option<String>,
    /// Final report flushed with the exit.
    pub report: Report,
}

impl UnitExit {
    /// Exit carried by a report that has its `exitCode` set.
    pub fn from_report(unit_id: impl Into<String>, report: Report) -> Self {
        Self {
            unit_id: unit_id.into(),
            exit_code: report.exit_code,
            reason: report.reason.clone(),
            report,
        }
    }
}

/// Something observed about one task.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The record changed or one of its timers fired.
    Changed(TaskKey),
    UnitExited { key: TaskKey, exit: UnitExit },
    Reported { key: TaskKey, report: Report },
    Liveness { key: TaskKey, signals: StuckSignals },
    CancelRequested { key: TaskKey, reason: String, force: bool },
    RetentionRequested { key: TaskKey, reason: Option<String> },
}

/// Totals of one [`Reconciler::reconcile_all`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub reconciled: usize,
    pub failed: usize,
    /// Shortest requeue delay any task asked for.
    pub next_requeue_secs: Option<u64>,
}

pub struct Reconciler<'a> {
    store: &'a dyn TaskStore,
    substrate: &'a dyn ExecutionSubstrate,
    clock: &'a dyn Clock,
    config: &'a OrchestratorConfig,
    prompts: PromptEngine,
    cache: ResultCache,
    metrics: Metrics,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a dyn TaskStore,
        substrate: &'a dyn ExecutionSubstrate,
        clock: &'a dyn Clock,
        config: &'a OrchestratorConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            substrate,
            clock,
            config,
            prompts: PromptEngine::new()?,
            cache: ResultCache::new(config.result_cache.clone()),
            metrics: Metrics::new()?,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Apply `observation`, then reconcile the task it concerns.
    pub fn handle(&self, observation: Observation) -> Result<ReconcileOutcome> {
        let key = match observation {
            Observation::Changed(key) => key,
            Observation::UnitExited { key, exit } => {
                self.observe_exit(&key, exit)?;
                key
            }
            Observation::Reported { key, report } => {
                self.report(&key, report)?;
                key
            }
            Observation::Liveness { key, signals } => {
                self.observe_signals(&key, signals)?;
                key
            }
            Observation::CancelRequested { key, reason, force } => {
                self.cancel(&key, &reason, force)?;
                key
            }
            Observation::RetentionRequested { key, reason } => {
                self.retain(&key, reason)?;
                key
            }
        };
        self.reconcile(&key)
    }

    /// Every admission violation `task` would hit, without storing it.
    ///
    /// Covers the parent cascade checks and every namespace policy. A parent
    /// that does not exist is itself a violation.
    pub fn review(&self, task: &Task) -> Result<Vec<Violation>> {
        Ok(self.review_with_parent(task)?.1)
    }

    /// Admission gate for new tasks.
    ///
    /// Any violation from [`Self::review`] rejects the write with
    /// [`AdmissionRejected`]. Accepted tasks are stored Pending with a fresh
    /// status.
    #[instrument(skip_all, fields(task = %task.key()))]
    pub fn admit(&self, task: Task) -> Result<Task> {
        let (parent, violations) = self.review_with_parent(&task)?;
        if !violations.is_empty() {
            warn!(violations = violations.len(), "admission rejected");
            return Err(AdmissionRejected {
                key: task.key(),
                violations,
            }
            .into());
        }

        let mut fresh = task;
        fresh.status = TaskStatus::default();
        let created = self.store.create_task(&fresh, self.clock.now())?;
        info!(tier = %created.spec.tier, "task admitted");

        if let Some(parent) = parent
            && parent.phase() == Phase::Waiting
        {
            let child = created.name().to_string();
            self.update(&parent.key(), |parent| {
                if parent.phase() != Phase::Waiting {
                    return Ok(None);
                }
                Ok(register_pending(&mut parent.status, &child).then_some(()))
            })?;
        }
        Ok(created)
    }

    /// Drive `key` one step toward where its phase says it should be.
    ///
    /// Usage that never reached the root's ledger is charged first, whatever
    /// the phase.
    #[instrument(skip_all, fields(task = %key))]
    pub fn reconcile(&self, key: &TaskKey) -> Result<ReconcileOutcome> {
        let Some(mut task) = self.load(key)? else {
            return Ok(ReconcileOutcome::Gone);
        };
        if self.settle_or_defer(&task)? {
            debug!("outstanding usage charged to the hierarchy");
            task = match self.load(key)? {
                Some(task) => task,
                None => return Ok(ReconcileOutcome::Gone),
            };
        }
        match task.phase() {
            Phase::Pending => self.reconcile_startable(task),
            Phase::Retrying if retry_due(&task, self.clock.now()) => self.reconcile_startable(task),
            Phase::Retrying => Ok(self.requeue(&task)),
            Phase::Running => self.reconcile_running(task),
            Phase::Waiting => self.reconcile_waiting(task),
            Phase::Completed
            | Phase::Failed
            | Phase::BudgetExceeded
            | Phase::TimedOut
            | Phase::Cancelled => self.reconcile_terminal(&task),
        }
    }

    /// Reconcile every task in the store, oldest first.
    ///
    /// A failure on one task is logged and counted; the pass goes on.
    pub fn reconcile_all(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        for namespace in self.store.list_namespaces()? {
            let tasks = self.store.list_tasks(&namespace)?;
            for key in reconcile_order(&tasks) {
                match self.reconcile(&key) {
                    Ok(outcome) => {
                        summary.reconciled += 1;
                        if let ReconcileOutcome::Requeue { after_secs } = outcome {
                            summary.next_requeue_secs = Some(
                                summary
                                    .next_requeue_secs
                                    .map_or(after_secs, |next| next.min(after_secs)),
                            );
                        }
                    }
                    Err(err) => {
                        summary.failed += 1;
                        warn!(task = %key, error = %format!("{err:#}"), "reconcile failed");
                    }
                }
            }
            let running = self
                .store
                .list_tasks(&namespace)?
                .iter()
                .filter(|task| task.phase() == Phase::Running)
                .count();
            self.metrics.set_active(&namespace, running);
        }
        info!(
            reconciled = summary.reconciled,
            failed = summary.failed,
            "reconcile pass finished"
        );
        Ok(summary)
    }

    /// Record the exit of `exit.unit_id` and move the task on.
    ///
    /// Exits from a unit that no longer serves the task are ignored. The
    /// final report is recorded before the phase changes so its usage is
    /// charged even when the unit failed.
    #[instrument(skip_all, fields(task = %key, unit = %exit.unit_id))]
    pub fn observe_exit(&self, key: &TaskKey, exit: UnitExit) -> Result<Option<TransitionSummary>> {
        let task = self.store.get_task(key)?;
        if !serves(&task, &exit.unit_id) {
            debug!(phase = %task.phase(), "exit of a stale unit ignored");
            return Ok(None);
        }
        let marker = exit.report.marker();
        if let Some(summary) = self.report(key, exit.report.clone())? {
            return Ok(Some(summary));
        }

        let task = self.store.get_task(key)?;
        if !serves(&task, &exit.unit_id) {
            return Ok(None);
        }
        let completed = TaskEvent::Completed { output: None };
        let event = match exit.exit_code {
            Some(0) => match marker {
                Some(StatusMarker::BudgetExceeded) => TaskEvent::BudgetExceeded {
                    reason: "execution unit stopped at its budget".to_string(),
                },
                Some(StatusMarker::Waiting) => {
                    let tasks = self.store.list_tasks(&key.namespace)?;
                    let pending = pending_children(&task, &tasks);
                    if pending.is_empty() {
                        debug!("waiting marker with no open children; completing");
                        completed
                    } else {
                        TaskEvent::CheckpointedForChildren { pending }
                    }
                }
                None => completed,
            },
            code => {
                let class = classify_failure(code, exit.reason.as_deref());
                debug!(exit_code = ?code, class = ?class, "execution unit failed");
                TaskEvent::ExecutionFailed {
                    reason: failure_reason(code, exit.reason.as_deref()),
                    exit_code: code,
                    retryable: class.is_retryable(),
                }
            }
        };

        let label = event.label();
        let ctx = self.context();
        let (stored, summary) = self.update(key, |task| {
            if !serves(task, &exit.unit_id) {
                return Ok(None);
            }
            Ok(Some(apply_event(task, event.clone(), &ctx)?))
        })?;
        let Some(summary) = summary else {
            return Ok(None);
        };
        self.after_write(&stored, label, &summary)?;
        if stored.phase() == Phase::Completed {
            self.remember(&stored);
        }
        Ok(Some(summary))
    }

    /// Accept a report from a running unit.
    ///
    /// The latest report wins for output. Token usage is cumulative within
    /// an attempt and summed across attempts; the total is checked against
    /// the task's own budget in the same write, then charged to the root's
    /// hierarchy ledger. A charge that fails is left outstanding for the next
    /// reconcile. Returns the transition when the report ended the task.
    #[instrument(skip_all, fields(task = %key))]
    pub fn report(&self, key: &TaskKey, report: Report) -> Result<Option<TransitionSummary>> {
        let report = report.normalized();
        if report.output.is_none() && report.tokens.is_none() && report.artifacts.is_empty() {
            return Ok(None);
        }
        let ctx = self.context();
        let prices = &self.config.prices;
        let (stored, recorded) = self.update(key, |task| {
            if task.is_terminal() {
                return Ok(None);
            }
            if let Some(output) = &report.output {
                task.status.output = Some(output.clone());
            }
            for artifact in &report.artifacts {
                if !task.status.artifacts.contains(artifact) {
                    task.status.artifacts.push(artifact.clone());
                }
            }
            if let Some(usage) = report.tokens {
                let model = task.spec.model.as_ref().map_or("", |model| model.name.as_str());
                let cost = prices.estimate_cost(model, usage);
                record_report(&mut task.status, usage, cost)?;
            }
            let exceeded = check_task_budget(
                task.spec.budget.as_ref(),
                task.status.tokens_used,
                task.status.estimated_cost_usd.as_deref(),
            )?;
            let summary = match exceeded {
                Some(reason) if can_transition(task.phase(), Phase::BudgetExceeded) => {
                    Some(apply_event(task, TaskEvent::BudgetExceeded { reason }, &ctx)?)
                }
                _ => None,
            };
            Ok(Some(summary))
        })?;
        let Some(summary) = recorded else {
            debug!("report for a finished task ignored");
            return Ok(None);
        };
        debug!(
            tokens = stored.status.tokens_used.map_or(0, |usage| usage.total()),
            artifacts = stored.status.artifacts.len(),
            "report recorded"
        );
        if let Some(summary) = &summary {
            self.after_write(&stored, "budget_exceeded", summary)?;
        }
        self.settle_or_defer(&stored)?;
        Ok(summary)
    }

    /// Score liveness signals for a Running task and act on the verdict.
    ///
    /// Thresholds resolve namespace default, then role, then task. Returns
    /// `None` when the task is not running.
    #[instrument(skip_all, fields(task = %key))]
    pub fn observe_signals(&self, key: &TaskKey, signals: StuckSignals) -> Result<Option<StuckVerdict>> {
        let task = self.store.get_task(key)?;
        if task.phase() != Phase::Running {
            return Ok(None);
        }
        let role = self.role_for(&task)?;
        let role_overrides = role
            .as_ref()
            .and_then(|role| role.spec.health.as_ref())
            .and_then(|health| health.stuck_detection.as_ref());
        let thresholds = resolve_thresholds(
            &self.config.stuck_detection,
            role_overrides,
            task.spec.stuck_overrides(),
        );
        let verdict = evaluate(&signals, &thresholds);
        self.metrics.stuck_checked(&task, &signals, &verdict);
        if verdict.is_stuck() {
            warn!(
                action = verdict.action.as_str(),
                score = verdict.score,
                reason = %verdict.reason,
                "task looks stuck"
            );
            let event = TaskEvent::Stuck {
                action: verdict.action,
                reason: verdict.reason.clone(),
            };
            match self.transition(key, event) {
                Ok(_) => {}
                Err(err) if is_already_terminal(&err) => debug!("task finished before the verdict"),
                Err(err) => return Err(err),
            }
        }
        Ok(Some(verdict))
    }

    /// [`Self::observe_signals`] with signals read from a unit's activity log.
    pub fn observe_log(
        &self,
        key: &TaskKey,
        log: &str,
        last_progress: DateTime<Utc>,
    ) -> Result<Option<StuckVerdict>> {
        let signals = signals_from_log(log, last_progress, self.clock.now());
        self.observe_signals(key, signals)
    }

    /// Cancel `key` and every non-terminal task below it, parents first.
    ///
    /// Fails with [`TransitionError::AlreadyTerminal`] when `key` is already
    /// terminal. Units keep running unless `force` is set.
    #[instrument(skip_all, fields(task = %key, force))]
    pub fn cancel(&self, key: &TaskKey, reason: &str, force: bool) -> Result<TransitionSummary> {
        let (task, summary) = self.cancel_one(key, reason.to_string(), force)?;
        let tasks = self.store.list_tasks(&key.namespace)?;
        let cascade = format!("ancestor {} cancelled: {reason}", task.name());
        for member in members_top_down(&task, &tasks, self.config.max_hierarchy_depth) {
            if member.name() == task.name() || member.is_terminal() {
                continue;
            }
            match self.cancel_one(&member.key(), cascade.clone(), force) {
                Ok(_) => {}
                Err(err) if is_not_found(&err) || is_already_terminal(&err) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(summary)
    }

    /// Record retention metadata. Nothing else changes.
    #[instrument(skip_all, fields(task = %key))]
    pub fn retain(&self, key: &TaskKey, reason: Option<String>) -> Result<Task> {
        let now = self.clock.now();
        let (task, _) = self.update(key, |task| {
            task.metadata.retention = Some(Retention {
                retain: true,
                reason: reason.clone(),
                retained_at: now,
            });
            Ok(Some(()))
        })?;
        info!(reason = reason.as_deref().unwrap_or(""), "retention recorded");
        Ok(task)
    }

    /// Delete `key`. A running unit is terminated and the parent stops
    /// waiting on the task.
    #[instrument(skip_all, fields(task = %key))]
    pub fn delete(&self, key: &TaskKey) -> Result<()> {
        let task = self.store.get_task(key)?;
        self.store.delete_task(key)?;
        info!(phase = %task.phase(), "task deleted");
        if task.phase() == Phase::Running
            && let Some(unit_id) = &task.status.unit_id
        {
            self.terminate_unit(unit_id);
        }
        if let Some(parent) = task.spec.parent() {
            self.notify_parent(&task, parent)?;
        }
        Ok(())
    }

    fn review_with_parent(&self, task: &Task) -> Result<(Option<Task>, Vec<Violation>)> {
        let namespace = &task.metadata.namespace;
        let mut violations = Vec::new();
        let parent = match task.spec.parent() {
            None => None,
            Some(parent) => match self.store.get_task(&TaskKey::new(namespace, parent)) {
                Ok(parent) => Some(parent),
                Err(StoreError::NotFound { .. }) => {
                    violations.push(Violation::invalid(
                        "spec.parentTaskId",
                        format!("parent task {parent} not found in namespace {namespace}"),
                    ));
                    None
                }
                Err(err) => return Err(err.into()),
            },
        };
        violations.extend(validate_task(task, parent.as_ref()));
        let policies = self.store.list_policies(namespace)?;
        violations.extend(check_policies(task, &policies, &self.config.default_image));
        Ok((parent, violations))
    }

    fn reconcile_startable(&self, task: Task) -> Result<ReconcileOutcome> {
        let key = task.key();
        let tasks = self.store.list_tasks(&key.namespace)?;
        if !self.may_start(&task, &tasks)? {
            return Ok(ReconcileOutcome::Done);
        }
        if task.phase() == Phase::Pending && self.complete_from_cache(&task)? {
            return Ok(ReconcileOutcome::Done);
        }
        let policies = self.store.list_policies(&key.namespace)?;
        let running = tasks.iter().filter(|t| t.phase() == Phase::Running).count();
        if let Some(message) = concurrency_limit_reached(&policies, running) {
            debug!(running, "concurrency cap reached; start deferred");
            self.note(&key, message)?;
            return Ok(ReconcileOutcome::Requeue {
                after_secs: self.config.requeue.pending_secs,
            });
        }
        self.start_unit(task, &policies)
    }

    fn reconcile_running(&self, task: Task) -> Result<ReconcileOutcome> {
        let key = task.key();
        let default_timeout = self.config.default_timeout_secs;
        if timed_out(&task, self.clock.now(), default_timeout) {
            let limit_secs = effective_timeout(&task, default_timeout);
            warn!(limit_secs, "task timed out");
            self.transition(&key, TaskEvent::TimedOut { limit_secs })?;
            return Ok(ReconcileOutcome::Done);
        }
        if let Some(reason) = check_task_budget(
            task.spec.budget.as_ref(),
            task.status.tokens_used,
            task.status.estimated_cost_usd.as_deref(),
        )? {
            self.transition(&key, TaskEvent::BudgetExceeded { reason })?;
            return Ok(ReconcileOutcome::Done);
        }
        Ok(self.requeue(&task))
    }

    /// Sync the pending set with the namespace and resume once it is empty.
    fn reconcile_waiting(&self, task: Task) -> Result<ReconcileOutcome> {
        let key = task.key();
        let tasks = self.store.list_tasks(&key.namespace)?;
        let open = pending_children(&task, &tasks);
        let (task, _) = self.update(&key, |task| {
            if task.phase() != Phase::Waiting {
                return Ok(None);
            }
            let mut changed = false;
            for name in task.status.pending_children.clone() {
                if !open.contains(&name) {
                    changed |= resolve_pending(&mut task.status, &name);
                }
            }
            for name in &open {
                changed |= register_pending(&mut task.status, name);
            }
            Ok(changed.then_some(()))
        })?;

        if task.phase() != Phase::Waiting {
            return Ok(self.requeue(&task));
        }
        if !task.status.pending_children.is_empty() {
            debug!(pending = task.status.pending_children.len(), "waiting on children");
            return Ok(self.requeue(&task));
        }
        if !self.may_start(&task, &tasks)? {
            return Ok(ReconcileOutcome::Done);
        }
        let policies = self.store.list_policies(&key.namespace)?;
        self.start_unit(task, &policies)
    }

    /// Replay a parent notification that an earlier pass may have lost.
    fn reconcile_terminal(&self, task: &Task) -> Result<ReconcileOutcome> {
        let Some(parent) = task.spec.parent() else {
            return Ok(ReconcileOutcome::Done);
        };
        let key = TaskKey::new(&task.metadata.namespace, parent);
        match self.store.get_task(&key) {
            // A finished parent takes no more notifications.
            Ok(record) if record.is_terminal() => {}
            Ok(record) => {
                let status = &record.status;
                let known = status.child_tasks.iter().any(|name| name == task.name());
                let pending = status.pending_children.iter().any(|name| name == task.name());
                if !known || pending {
                    debug!(parent = %key, "replaying parent notification");
                    self.notify_parent(task, parent)?;
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(ReconcileOutcome::Done)
    }

    /// Hierarchy and budget gate ahead of any start.
    ///
    /// Returns false after moving the task to Failed (broken hierarchy) or
    /// BudgetExceeded (own or tree-wide ceiling already reached).
    fn may_start(&self, task: &Task, tasks: &[Task]) -> Result<bool> {
        let key = task.key();
        let root = match find_root(task, tasks, self.config.max_hierarchy_depth) {
            Ok(root) => root,
            Err(err) => {
                warn!(error = %err, "task cannot join its hierarchy");
                self.transition(&key, TaskEvent::Failed { reason: err.to_string() })?;
                return Ok(false);
            }
        };
        let own = check_task_budget(
            task.spec.budget.as_ref(),
            task.status.tokens_used,
            task.status.estimated_cost_usd.as_deref(),
        )?;
        let tree = match tasks.iter().find(|candidate| candidate.name() == root) {
            Some(root) => check_hierarchy(root)?,
            None => None,
        };
        if let Some(reason) = own.or(tree) {
            info!(root = %root, reason = %reason, "start refused by budget");
            self.transition(&key, TaskEvent::BudgetExceeded { reason })?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Complete a Pending task from the result cache. Returns true on a hit.
    fn complete_from_cache(&self, task: &Task) -> Result<bool> {
        if !self.cache.enabled() || task.metadata.no_cache {
            return Ok(false);
        }
        let digest = cache_key(task);
        let Some(hit) = self.cache.get(&digest, self.clock.now()) else {
            return Ok(false);
        };
        let ctx = self.context();
        let unit_id = format!("cache:{}", digest.get(..12).unwrap_or(&digest));
        let (stored, summary) = self.update(&task.key(), |task| {
            if task.phase() != Phase::Pending {
                return Ok(None);
            }
            apply_event(task, TaskEvent::Started { unit_id: unit_id.clone() }, &ctx)?;
            let mut summary = apply_event(
                task,
                TaskEvent::Completed {
                    output: Some(hit.output.clone()),
                },
                &ctx,
            )?;
            summary.from = Phase::Pending;
            // Nothing was spent, so no usage is recorded or charged.
            task.status.message = Some(match hit.tokens {
                Some(saved) => format!(
                    "Task completed from cached result of {} ({} tokens saved)",
                    hit.model,
                    saved.total()
                ),
                None => format!("Task completed from cached result of {}", hit.model),
            });
            Ok(Some(summary))
        })?;
        let Some(summary) = summary else {
            return Ok(false);
        };
        info!(key = %digest, "completed from result cache");
        self.after_write(&stored, "cache_hit", &summary)?;
        Ok(true)
    }

    /// Start a unit for the next attempt (or the Waiting resume) and record it.
    fn start_unit(&self, task: Task, policies: &[Policy]) -> Result<ReconcileOutcome> {
        let key = task.key();
        let role = self.role_for(&task)?;
        let resuming = task.phase() == Phase::Waiting;
        let attempt = if resuming {
            task.status.attempts.max(1)
        } else {
            task.status.attempts.saturating_add(1)
        };
        let request = self.prompts.build_request(&RequestInputs {
            task: &task,
            role: role.as_ref(),
            policies,
            attempt,
            default_image: &self.config.default_image,
            default_timeout_secs: self.config.default_timeout_secs,
        })?;

        let unit_id = match self.substrate.start(&request) {
            Ok(unit_id) => unit_id,
            Err(err) => return self.start_failed(&task, attempt, &err),
        };

        let mut next = task;
        let summary = apply_event(&mut next, TaskEvent::Started { unit_id: unit_id.clone() }, &self.context())?;
        match self.store.update_task(&next) {
            Ok(stored) => {
                self.after_write(&stored, "started", &summary)?;
                Ok(self.requeue(&stored))
            }
            Err(err) => {
                // A unit whose start was never recorded must not keep running.
                self.terminate_unit(&unit_id);
                if err.is_conflict() {
                    debug!("task changed while starting; retrying");
                    Ok(ReconcileOutcome::Requeue { after_secs: 0 })
                } else {
                    Err(err).with_context(|| format!("record start of {key}"))
                }
            }
        }
    }

    fn start_failed(&self, task: &Task, attempt: u32, err: &SubstrateError) -> Result<ReconcileOutcome> {
        let key = task.key();
        let retryable = matches!(err, SubstrateError::Retryable(_));
        warn!(attempt, retryable, error = %err, "execution unit not started");
        if task.phase() == Phase::Waiting {
            // Resuming consumes no attempt, so there is no backoff to schedule.
            if retryable {
                self.note(&key, err.to_string())?;
                return Ok(ReconcileOutcome::Requeue {
                    after_secs: self.config.requeue.pending_secs,
                });
            }
            self.transition(&key, TaskEvent::Failed { reason: err.to_string() })?;
            return Ok(ReconcileOutcome::Done);
        }
        let event = TaskEvent::ScheduleFailed {
            reason: err.to_string(),
            retryable,
        };
        let (stored, _) = self.transition(&key, event)?;
        Ok(self.requeue(&stored))
    }

    /// [`Self::settle_hierarchy`], leaving a charge the ledger could not land
    /// outstanding instead of failing the caller.
    fn settle_or_defer(&self, task: &Task) -> Result<bool> {
        match self.settle_hierarchy(task) {
            Ok(settled) => Ok(settled),
            Err(err) if err.downcast_ref::<LedgerError>().is_some() => {
                warn!(error = %format!("{err:#}"), "hierarchy charge deferred to the next reconcile");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Charge `task`'s outstanding usage to its root and stop the tree if
    /// that reached the ceiling. Returns true when there was anything to
    /// charge.
    fn settle_hierarchy(&self, task: &Task) -> Result<bool> {
        if outstanding_charge(&task.status)?.is_empty() {
            return Ok(false);
        }
        let tasks = self.store.list_tasks(&task.metadata.namespace)?;
        let root = match find_root(task, &tasks, self.config.max_hierarchy_depth) {
            Ok(root) => root,
            Err(err) => {
                warn!(error = %err, "usage not charged to the hierarchy");
                return Ok(false);
            }
        };
        let root_key = TaskKey::new(&task.metadata.namespace, root);
        let ledger = BudgetLedger::new(self.store, self.config.conflict_retry_limit);
        if let Some(reason) = ledger.settle(task, &root_key)? {
            self.exhaust_hierarchy(task, &root_key, &reason)?;
        }
        Ok(true)
    }

    /// Stop a tree whose shared ceiling was reached.
    ///
    /// The reporter and its ancestors end BudgetExceeded; every other open
    /// member is cancelled and its unit terminated. Parents go first so no
    /// Waiting parent resumes halfway through.
    fn exhaust_hierarchy(&self, reporter: &Task, root_key: &TaskKey, reason: &str) -> Result<()> {
        let depth = self.config.max_hierarchy_depth;
        let tasks = self.store.list_tasks(&root_key.namespace)?;
        let Some(root) = tasks.iter().find(|task| task.name() == root_key.name) else {
            return Ok(());
        };
        let mut exceeded = vec![reporter.name()];
        exceeded.extend(
            ancestors(reporter, &tasks, depth)
                .unwrap_or_default()
                .into_iter()
                .map(Task::name),
        );
        let path = task_path(reporter, &tasks, depth).unwrap_or_else(|_| reporter.name().to_string());
        warn!(root = %root_key, reporter = %path, reason, "hierarchy budget exhausted");

        for member in members_top_down(root, &tasks, depth) {
            if member.is_terminal() {
                continue;
            }
            let key = member.key();
            let outcome = if exceeded.contains(&member.name()) {
                let event = TaskEvent::BudgetExceeded {
                    reason: reason.to_string(),
                };
                self.transition(&key, event).map(|_| ())
            } else {
                self.cancel_one(&key, format!("hierarchy budget exceeded: {reason}"), true)
                    .map(|_| ())
            };
            match outcome {
                Ok(()) => {}
                Err(err) if is_not_found(&err) || is_already_terminal(&err) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn cancel_one(&self, key: &TaskKey, reason: String, force: bool) -> Result<(Task, TransitionSummary)> {
        let (task, summary) = self.transition(key, TaskEvent::Cancel { reason })?;
        let summary = summary.with_context(|| format!("cancel left {key} unchanged"))?;
        if force
            && summary.from == Phase::Running
            && let Some(unit_id) = &task.status.unit_id
        {
            self.terminate_unit(unit_id);
        }
        Ok((task, summary))
    }

    /// Tell `parent` that `child` is done with, and resume it if nothing
    /// else is pending.
    fn notify_parent(&self, child: &Task, parent: &str) -> Result<()> {
        let key = TaskKey::new(&child.metadata.namespace, parent);
        let event = TaskEvent::ChildResolved {
            child: child.name().to_string(),
        };
        match self.transition(&key, event) {
            Ok((parent, _)) => {
                if parent.phase() == Phase::Waiting && parent.status.pending_children.is_empty() {
                    self.reconcile(&key)?;
                }
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                debug!(parent = %key, "parent gone; nothing to notify");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Apply `event` through the state machine and carry out its effects.
    ///
    /// Returns the stored task and the summary, or `None` when the event
    /// changed nothing and no write was made.
    fn transition(&self, key: &TaskKey, event: TaskEvent) -> Result<(Task, Option<TransitionSummary>)> {
        let label = event.label();
        let ctx = self.context();
        let (task, summary) = self.update(key, |task| {
            let before = task.status.clone();
            let summary = apply_event(task, event.clone(), &ctx)?;
            Ok((task.status != before).then_some(summary))
        })?;
        if let Some(summary) = &summary {
            self.after_write(&task, label, summary)?;
        }
        Ok((task, summary))
    }

    fn after_write(&self, task: &Task, label: &str, summary: &TransitionSummary) -> Result<()> {
        if summary.changed() {
            info!(
                task = %task.key(),
                event = label,
                from = %summary.from,
                to = %summary.to,
                attempts = task.status.attempts,
                "phase changed"
            );
        } else {
            debug!(task = %task.key(), event = label, phase = %summary.to, "status updated");
        }
        self.metrics.phase_changed(task, summary);
        let problems = check_status_invariants(task, self.config.retry.max_attempts);
        if !problems.is_empty() {
            warn!(task = %task.key(), problems = %problems.join("; "), "status invariants violated");
        }
        self.apply_effects(task, &summary.effects)
    }

    fn apply_effects(&self, task: &Task, effects: &[Effect]) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::TerminateUnit { unit_id } => self.terminate_unit(unit_id),
                Effect::NotifyParent { parent } => self.notify_parent(task, parent)?,
                Effect::Escalate { parent, reason } => {
                    let key = TaskKey::new(&task.metadata.namespace, parent);
                    let event = TaskEvent::ChildEscalated {
                        child: task.name().to_string(),
                        reason: reason.clone(),
                    };
                    match self.transition(&key, event) {
                        Ok(_) => {}
                        Err(err) if is_not_found(&err) => debug!(parent = %key, "escalation target gone"),
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }

    fn terminate_unit(&self, unit_id: &str) {
        match self.substrate.terminate(unit_id) {
            Ok(()) => info!(unit = unit_id, "execution unit terminated"),
            Err(err) => warn!(unit = unit_id, error = %format!("{err:#}"), "terminating execution unit failed"),
        }
    }

    /// Set a human-readable message without touching the phase.
    fn note(&self, key: &TaskKey, message: String) -> Result<()> {
        self.update(key, |task| {
            if task.is_terminal() || task.status.message.as_deref() == Some(message.as_str()) {
                return Ok(None);
            }
            task.status.message = Some(message.clone());
            Ok(Some(()))
        })?;
        Ok(())
    }

    fn remember(&self, task: &Task) {
        if !self.cache.enabled() || task.metadata.no_cache {
            return;
        }
        let Some(output) = task.status.output.clone() else {
            return;
        };
        let result = CachedResult {
            output,
            tokens: task.status.tokens_used,
            model: task
                .spec
                .model
                .as_ref()
                .map(|model| model.name.clone())
                .unwrap_or_default(),
        };
        self.cache.put(&cache_key(task), result, self.clock.now());
    }

    fn role_for(&self, task: &Task) -> Result<Option<Role>> {
        let Some(name) = task.spec.role.as_deref().filter(|name| !name.is_empty()) else {
            return Ok(None);
        };
        let namespace_roles = self.store.list_roles(&task.metadata.namespace)?;
        let cluster_roles = self.store.list_cluster_roles()?;
        let role = resolve_role(name, &namespace_roles, &cluster_roles).cloned();
        if role.is_none() {
            warn!(task = %task.key(), role = name, "role not found; running without role rules");
        }
        Ok(role)
    }

    fn requeue(&self, task: &Task) -> ReconcileOutcome {
        let requeue = &self.config.requeue;
        let timer = next_timer(task, self.clock.now(), self.config.default_timeout_secs).map(ceil_secs);
        let after_secs = match task.phase() {
            phase if phase.is_terminal() => return ReconcileOutcome::Done,
            Phase::Retrying => timer.unwrap_or(0),
            Phase::Running => timer.map_or(requeue.running_secs, |secs| secs.min(requeue.running_secs)),
            Phase::Waiting => requeue.waiting_secs,
            _ => requeue.pending_secs,
        };
        ReconcileOutcome::Requeue { after_secs }
    }

    fn load(&self, key: &TaskKey) -> Result<Option<Task>> {
        match self.store.get_task(key) {
            Ok(task) => Ok(Some(task)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn update<T>(
        &self,
        key: &TaskKey,
        mutate: impl FnMut(&mut Task) -> Result<Option<T>>,
    ) -> Result<(Task, Option<T>)> {
        update_with_retry(self.store, key, self.config.conflict_retry_limit, mutate)
    }

    fn context(&self) -> TransitionContext {
        TransitionContext {
            now: self.clock.now(),
            retry_defaults: self.config.retry.clone(),
        }
    }
}

fn serves(task: &Task, unit_id: &str) -> bool {
    task.phase() == Phase::Running && task.status.unit_id.as_deref() == Some(unit_id)
}

fn failure_reason(exit_code: Option<i32>, reason: Option<&str>) -> String {
    match (exit_code, reason.filter(|reason| !reason.is_empty())) {
        (Some(code), Some(reason)) => format!("exit code {code}: {reason}"),
        (Some(code), None) => format!("exit code {code}"),
        (None, Some(reason)) => reason.to_string(),
        (None, None) => "execution unit vanished".to_string(),
    }
}

fn ceil_secs(remaining: Duration) -> u64 {
    let millis = remaining.num_milliseconds().max(0);
    u64::try_from((millis + 999) / 1000).unwrap_or(0)
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::NotFound { .. }))
}

/// True for the "already terminal" rejection of the state machine.
pub fn is_already_terminal(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TransitionError>(),
        Some(TransitionError::AlreadyTerminal { .. })
    )
}
