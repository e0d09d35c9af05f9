//! Tracing and logging (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// The format comes from `LOG_FORMAT` (`json` by default, or `pretty`).
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;
