//! Deterministic, pure logic for the task lifecycle.
//!
//! Core modules perform no I/O and do not log. They operate on in-memory
//! tasks and return values or stable error lists suitable for tests.

pub mod budget;
pub mod children;
pub mod classifier;
pub mod hierarchy;
pub mod immutability;
pub mod invariants;
pub mod policy_validator;
pub mod pricing;
pub mod retry;
pub mod roles;
pub mod selector;
pub mod state_machine;
pub mod stuck;
pub mod types;
