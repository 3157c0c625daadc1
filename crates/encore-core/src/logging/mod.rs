//! Structured logging with `tracing`.
//!
//! - [`init_subscriber`] installs a compact stderr subscriber
//! - [`init_json_subscriber`] installs a JSON-lines subscriber for log shipping
//! - [`test_utils::capture_logs`] captures events in memory for assertions
//!
//! `RUST_LOG` takes precedence over the configured level in both initializers.

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber with human-readable stderr output.
///
/// Call once at application startup. Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - Minimum log level to display (e.g. `"warn"`).
pub fn init_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init is a no-op if a global default is already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber with JSON-lines output on stderr.
pub fn init_json_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .json();

    let _ = subscriber.try_init();
}
