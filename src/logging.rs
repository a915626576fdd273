//! Tracing setup for the `promote` binary.
//!
//! Diagnostics go to stderr so stdout stays reserved for command output
//! (run summaries, diffs, identifiers). `RUST_LOG` overrides the default
//! filter entirely.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter: `promote=info`, or `promote=debug` when verbose.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { "promote=debug" } else { "promote=info" }
}

/// Initialize the global subscriber. Compact text unless `json` is set.
pub fn init(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .init();
    }
}
