//! Logging configuration and initialization.

use super::AppConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process. `RUST_LOG` wins over the verbosity
/// flag when set.
pub fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.verbose >= 2)
        .with_line_number(config.verbose >= 3)
        .with_writer(std::io::stderr)
        .try_init();

    if result.is_ok() {
        debug!("sdqctl started with verbosity level {}", config.verbose);
    }
}
