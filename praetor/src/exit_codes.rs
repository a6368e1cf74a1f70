//! Stable exit codes for praetor CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, unreadable store, or any other error.
pub const INVALID: i32 = 1;
/// Admission rejected the task (validation or policy violations).
pub const REJECTED: i32 = 2;
/// `praetor cancel` targeted a task that is already terminal.
pub const TERMINAL: i32 = 3;
