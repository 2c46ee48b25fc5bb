//! Diagnostic tracing for the transport layer.
//!
//! Library code only emits `tracing` events inside per-component spans
//! (`ssh-agent`, `cmd-runner`, `event-stream`); installing a subscriber is
//! left to the binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output is compact and goes to
/// stderr so stdout stays clean for command results.
///
/// # Example
/// ```bash
/// RUST_LOG=gerrit_ssh=debug gerrit-ssh --host review.example.org version
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
