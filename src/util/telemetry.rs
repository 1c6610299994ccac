//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Install the default tracing subscriber for embedders that have none: an
/// fmt layer filtered by `RUST_LOG`, falling back to `info` so scheduler
/// lifecycle and recovery events stay visible. A subscriber installed by the
/// embedder wins; calling this twice is harmless.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
