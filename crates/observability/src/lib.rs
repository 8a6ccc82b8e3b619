//! Tracing and logging setup shared by processes that host job executors.

/// Initialize process-wide tracing/logging.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;
