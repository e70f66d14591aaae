//! Logging bootstrap.
//!
//! The repository only emits `tracing` events; installing a subscriber is
//! the hosting binary's job. [`init_logging`] is the one-call bootstrap for
//! those binaries: it respects `RUST_LOG`, defaults to `info`, and picks an
//! output format per deployment.

use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Installs the global `tracing` subscriber.
///
/// Filtering comes from `RUST_LOG` (e.g. `info`,
/// `tiller_repository=debug`), falling back to `info`. Later calls find a
/// subscriber already installed and leave it in place, so it is safe to
/// call from multiple entry points.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    if result.is_err() {
        // A subscriber installed by an earlier call (or by the host) wins.
        tracing::debug!("tracing subscriber already installed");
    }
}
