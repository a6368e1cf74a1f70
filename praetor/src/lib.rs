//! Supervisor for hierarchical, budget-constrained AI-agent tasks.
//!
//! A task may spawn child tasks; every task in a tree shares governance
//! (tier ceiling, capability ceiling, token and cost budget) and runs through
//! a supervised lifecycle with retries, timeouts, and stuck detection.
//!
//! - **[`core`]**: pure lifecycle rules (state machine, admission checks,
//!   budgets, retry, child discovery, stuck scoring). No I/O, no logging.
//! - **[`io`]**: versioned stores, config, schemas, the execution substrate,
//!   request rendering, and report parsing.
//!
//! [`reconcile`] joins the two, and [`ledger`] keeps tree-wide usage on root
//! tasks under concurrent reports. [`metrics`] counts what the reconciler
//! does in Prometheus form.

pub mod clock;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod reconcile;
pub mod role;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
