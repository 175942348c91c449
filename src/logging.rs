//! Tracing subscriber setup.
//!
//! Log events go to stderr so that command output on stdout (run summaries,
//! `--json` results) stays machine-readable.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, then `LOG_LEVEL`, then `default_level`
/// (the configured `[logging] level`). Calling this twice is a no-op.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
