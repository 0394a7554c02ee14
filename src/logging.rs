//! Tracing setup for binaries, demos and tests.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to `default_directive`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
