//! Logging bootstrap.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber.
///
/// `RUST_LOG` selects the filter; the default only reports warnings. Output
/// goes to stderr because stdout carries message data.
pub fn init_tracing() {
    const NOISY_CRATES: &str = ",hickory_proto=error,hickory_resolver=error";

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn{NOISY_CRATES}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
