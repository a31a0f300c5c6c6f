//! Logging setup for simulation runs.
//!
//! Installs a tracing-subscriber with an env-filter so harness runs and
//! tests can be inspected with `RUST_LOG=bazaar_core_overlay=trace`.

use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Install the test subscriber. Safe to call any number of times from any
/// test; only the first call in the process installs.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_test_writer();
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    });
}
