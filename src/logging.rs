//! Tracing setup for the CLI.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// Log level is controlled through `RUST_LOG` (default `info`); output goes
/// to stderr so it never mixes with command output on stdout.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
