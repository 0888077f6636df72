//! Structured logging for goalweave.
//!
//! Log levels:
//! - ERROR: Failures that abort an operation
//! - WARN: Recoverable problems (task failures, store outages, detection timeouts)
//! - INFO: Run lifecycle (start, level boundaries, completion)
//! - DEBUG: Scheduling and detection decisions
//! - TRACE: Per-node state transitions
//!
//! `RUST_LOG` takes precedence. Otherwise debug output can be enabled with
//! `init_with_debug(true)` or the `GOALWEAVE_DEBUG=1` env var.

use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "GOALWEAVE_DEBUG";

/// Install the global subscriber at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Install the global subscriber. Calling this more than once is harmless.
pub fn init_with_debug(debug: bool) {
    let fallback = default_level(debug || env_debug());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Whether `GOALWEAVE_DEBUG` asks for debug output.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_level(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}
