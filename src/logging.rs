//! Tracing setup for binaries and tests that embed the session core.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "OPENCODE_LOG";

const DEFAULT_FILTER: &str = "opencode_session=info";

/// Installs a stderr `fmt` subscriber filtered by `OPENCODE_LOG`.
///
/// Safe to call more than once; only the first call does anything, and an
/// already-installed global subscriber is left in place.
pub fn init_tracing() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let result = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init();
        if result.is_err() {
            tracing::debug!("global tracing subscriber already installed");
        }
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
