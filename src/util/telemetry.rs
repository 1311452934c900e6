//! Log subscriber setup for labs and tests.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset: scheduler decisions at info.
pub const DEFAULT_LOG_FILTER: &str = "lab_arbiter=info";

/// Install a fmt subscriber unless one is already set.
///
/// Filtering follows `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
/// Thread names are printed since every task body runs on a thread named
/// after its worker id.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}
