use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Diagnostics go to stderr so that the
/// accuracy lines on stdout stay machine readable. Filtered by `RUST_LOG`,
/// `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (e.g. from tests) is harmless, keep the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
