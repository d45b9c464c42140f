use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the tracing filter (e.g. `debug`,
/// `imgdedup=debug,sqlx=warn`).
pub const LOG_ENV: &str = "DEDUP_LOG";

/// Install the global subscriber. Diagnostics go to stderr so stdout
/// carries only command output.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
