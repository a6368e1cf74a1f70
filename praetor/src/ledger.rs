//! Tree-wide budget ledger kept on root tasks.
//!
//! Descendants report usage concurrently against the same root, so every
//! charge is a read-modify-write through [`update_with_retry`]. A blind
//! overwrite would drop reports.
//!
//! Each task remembers how much of its own usage already reached the root
//! (`hierarchyChargedTokens` and `hierarchyChargedCost`). The marker moves
//! only after the root write lands, so a charge that fails is retried from
//! the next report or reconcile pass instead of being lost.

use tracing::{debug, instrument};

use crate::core::budget::{
    accumulate, add_cost, add_usage, check_hierarchy, cost_delta, format_cost, parse_cost, usage_delta,
};
use crate::error::{CostParseError, LedgerError, StoreError};
use crate::io::store::{TaskStore, update_with_retry};
use crate::task::{Task, TaskKey, TaskStatus, TokenUsage};

/// Usage not yet accounted for somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Charge {
    pub usage: TokenUsage,
    pub cost: f64,
}

impl Charge {
    pub fn is_empty(&self) -> bool {
        self.usage.is_zero() && self.cost <= 0.0
    }
}

/// Fold a report into the task's totals and return what it added.
///
/// Reports are cumulative within one attempt. A retried unit starts counting
/// from zero again, so the delta is taken against the current attempt's
/// latest report while `tokensUsed` and `estimatedCostUsd` keep summing
/// across attempts. A report lower than an earlier one adds nothing.
pub fn record_report(
    status: &mut TaskStatus,
    usage: TokenUsage,
    cost: Option<String>,
) -> Result<Charge, CostParseError> {
    let charge = Charge {
        usage: usage_delta(status.attempt_tokens_used, usage),
        cost: cost_delta(status.attempt_cost_usd.as_deref(), cost.as_deref())?,
    };
    add_usage(&mut status.tokens_used, charge.usage);
    add_cost(&mut status.estimated_cost_usd, charge.cost)?;
    add_usage(&mut status.attempt_tokens_used, charge.usage);
    if cost.is_some() {
        add_cost(&mut status.attempt_cost_usd, charge.cost)?;
    }
    Ok(charge)
}

/// Usage on `status` that has not reached the root yet.
pub fn outstanding_charge(status: &TaskStatus) -> Result<Charge, CostParseError> {
    Ok(Charge {
        usage: usage_delta(
            status.hierarchy_charged_tokens,
            status.tokens_used.unwrap_or_default(),
        ),
        cost: cost_delta(
            status.hierarchy_charged_cost.as_deref(),
            status.estimated_cost_usd.as_deref(),
        )?,
    })
}

/// Move the charged marker up to the given totals. Returns false when the
/// marker already covers them.
fn advance_charged(
    status: &mut TaskStatus,
    tokens: TokenUsage,
    cost: Option<&str>,
) -> Result<bool, CostParseError> {
    let charged = status.hierarchy_charged_tokens.unwrap_or_default();
    let next = TokenUsage::new(charged.input.max(tokens.input), charged.output.max(tokens.output));
    let mut changed = status.hierarchy_charged_tokens != Some(next);
    status.hierarchy_charged_tokens = Some(next);

    if let Some(raw) = cost.filter(|raw| !raw.is_empty()) {
        let target = parse_cost(raw)?;
        let charged = match status.hierarchy_charged_cost.as_deref() {
            Some(raw) if !raw.is_empty() => Some(parse_cost(raw)?),
            _ => None,
        };
        if charged.is_none_or(|charged| target > charged) {
            status.hierarchy_charged_cost = Some(format_cost(target));
            changed = true;
        }
    }
    Ok(changed)
}

pub struct BudgetLedger<'a> {
    store: &'a dyn TaskStore,
    conflict_retry_limit: u32,
}

impl<'a> BudgetLedger<'a> {
    pub fn new(store: &'a dyn TaskStore, conflict_retry_limit: u32) -> Self {
        Self {
            store,
            conflict_retry_limit,
        }
    }

    /// Add `charge` to `root`'s counters and check its ceiling.
    ///
    /// Roots without a hierarchy budget are left untouched. Returns the
    /// exhaustion reason once the ceiling is reached.
    #[instrument(skip_all, fields(root = %root, tokens = charge.usage.total()))]
    pub fn charge_root(&self, root: &TaskKey, charge: Charge) -> Result<Option<String>, LedgerError> {
        if charge.is_empty() {
            return Ok(None);
        }
        let (stored, applied) = update_with_retry::<_, (), LedgerError, _>(
            self.store,
            root,
            self.conflict_retry_limit,
            |task| {
                if task.spec.hierarchy_budget.is_none() {
                    return Ok(None);
                }
                accumulate(&mut task.status, charge.usage, charge.cost)?;
                Ok(Some(()))
            },
        )?;
        if applied.is_none() {
            return Ok(None);
        }
        debug!(
            used = stored.status.hierarchy_tokens_used.map_or(0, |u| u.total()),
            "hierarchy usage charged"
        );
        Ok(check_hierarchy(&stored)?)
    }

    /// Charge whatever part of `reporter`'s usage the root has not seen,
    /// then record that it has.
    ///
    /// Safe to call again after any failure: the marker on the reporter
    /// only advances once the root write is in. A crash between the two
    /// writes charges the same usage twice, which errs toward stopping the
    /// tree early rather than overspending.
    #[instrument(skip_all, fields(reporter = %reporter.key(), root = %root))]
    pub fn settle(&self, reporter: &Task, root: &TaskKey) -> Result<Option<String>, LedgerError> {
        let charge = outstanding_charge(&reporter.status)?;
        if charge.is_empty() {
            return Ok(None);
        }
        let tokens = reporter.status.tokens_used.unwrap_or_default();
        let cost = reporter.status.estimated_cost_usd.clone();
        let exhausted = self.charge_root(root, charge)?;

        let marked = update_with_retry::<_, (), LedgerError, _>(
            self.store,
            &reporter.key(),
            self.conflict_retry_limit,
            |task| Ok(advance_charged(&mut task.status, tokens, cost.as_deref())?.then_some(())),
        );
        match marked {
            Ok(_) => {}
            Err(LedgerError::Store(StoreError::NotFound { .. })) => {
                debug!("reporter deleted after its charge landed");
            }
            Err(err) => return Err(err),
        }
        Ok(exhausted)
    }
}
