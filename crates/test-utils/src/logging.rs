//! Log output for tests.

use tracing_subscriber::{EnvFilter, fmt};

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`. Output is captured by the test
/// harness and shown only for failing tests.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second call finds a subscriber already installed; that is fine.
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
