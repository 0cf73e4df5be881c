//! Diagnostic logging for the geoagent binary.
//!
//! geoagent writes two streams. Stage transitions, evaluation lines and the
//! REPL prompt are printed to stdout by `run` and `repl`; that text is what a
//! user reads and it never passes through `tracing`. Everything emitted with
//! `tracing` macros goes to stderr, filtered by `RUST_LOG`, so piping stdout
//! stays clean at any log level. Run artifacts on disk are written either way.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a compact stderr subscriber. Without `RUST_LOG` only warnings show:
///
/// ```bash
/// RUST_LOG=geoagent::io::process=debug geoagent run "clip the dem to the county"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
