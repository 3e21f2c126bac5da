//! Subscriber setup for the balancer binary.
//!
//! Every operational event is a single timestamped line. Warnings and errors
//! go to stderr, everything else to stdout.

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// The filter honors `RUST_LOG` and defaults to `info`. Panics if a global
/// subscriber is already set, so call it once, from `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // WARN and ERROR to stderr, lower severities to stdout.
    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();
}
