//! Diagnostic tracing for the pipeline.
//!
//! Output goes to stderr so that commands printing JSON on stdout stay
//! machine-readable.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`. Compact format on stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=pipeline=debug pipeline verify --repo . --edits edits.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
