//! Classification of execution-unit failures into retryable vs terminal.

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Crash, eviction, vanished unit, scheduling hiccup.
    Retryable,
    /// Retrying cannot help (bad image, missing command, config error).
    Terminal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        self == FailureClass::Retryable
    }
}

const TERMINAL_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Exit codes meaning the command could not run at all.
const TERMINAL_EXIT_CODES: &[i32] = &[126, 127];

/// Classify a failed unit by its exit code and substrate reason.
///
/// A unit that vanished without an exit code is retryable.
pub fn classify_failure(exit_code: Option<i32>, reason: Option<&str>) -> FailureClass {
    if let Some(reason) = reason
        && TERMINAL_REASONS.iter().any(|known| reason.contains(known))
    {
        return FailureClass::Terminal;
    }
    match exit_code {
        Some(code) if TERMINAL_EXIT_CODES.contains(&code) => FailureClass::Terminal,
        _ => FailureClass::Retryable,
    }
}
