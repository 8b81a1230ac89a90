//! Tracing subscriber setup for binaries and tests embedding the mesh.

use tracing_subscriber::EnvFilter;

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG`, or `info` if unset.
pub fn init_tracing() {
    init_tracing_with("info");
}

/// Like [`init_tracing`], falling back to `default_level` (e.g. the configured
/// `log_level`). Calling it again after a subscriber is installed is a no-op.
pub fn init_tracing_with(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing_with("debug");
        init_tracing();
        tracing::info!("tracing initialized");
    }
}
