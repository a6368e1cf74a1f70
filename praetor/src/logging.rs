//! Operator-facing tracing.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. Task status is the
//! product output; nothing here is persisted.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, falling back to `warn`. Compact format on stderr.
///
/// ```bash
/// RUST_LOG=praetor=debug praetor --store ./state reconcile
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
