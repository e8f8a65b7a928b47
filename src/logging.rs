use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. Diagnostics go to stderr so the stdio
/// transport keeps stdout clean for protocol frames.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
