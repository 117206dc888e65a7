//! Tracing subscriber initialization.
//!
//! Every entry point is safe to call more than once; only the first
//! installation wins.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// JSON logs at `info` unless `RUST_LOG` says otherwise.
pub fn init() {
    init_with_default(DEFAULT_DIRECTIVE);
}

/// JSON logs with a caller-chosen fallback filter, e.g. `"relay_infra=debug,info"`.
pub fn init_with_default(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_directive))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_current_span(true)
        .with_target(true)
        .try_init();
}

/// Human-readable output captured by the test harness.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .compact()
        .with_test_writer()
        .try_init();
}
