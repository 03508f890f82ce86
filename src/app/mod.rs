//! Application composition layer.
//!
//! Thin glue between `main` and the library: configuration of verbosity,
//! logging initialization, and the single place where errors become exit
//! codes.

pub mod logging;

pub use logging::init_logging;

use crate::error::Error;

/// Process-level configuration derived from global CLI flags.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub verbose: u8,
}

impl AppConfig {
    pub fn new(verbose: u8) -> Self {
        Self { verbose }
    }

    /// Default `RUST_LOG`-style filter for the verbosity level.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "sdqctl=warn",
            1 => "sdqctl=debug",
            2 => "sdqctl=trace",
            _ => "trace",
        }
    }
}

/// Initialize logging and any other process-wide facilities.
pub fn initialize_app(config: &AppConfig) {
    logging::init_logging(config);
}

/// Map a failure to its message and exit code. Durable suspensions are a
/// successful kind of stop and report as such.
pub fn handle_fatal_error(error: Error) -> ! {
    if error.is_suspension() {
        eprintln!("{error}");
        eprintln!("resume with: sdqctl sessions resume <session-id>");
    } else {
        eprintln!("error: {error}");
    }
    std::process::exit(error.exit_code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_levels() {
        assert_eq!(AppConfig::new(0).log_filter(), "sdqctl=warn");
        assert_eq!(AppConfig::new(1).log_filter(), "sdqctl=debug");
        assert_eq!(AppConfig::new(3).log_filter(), "trace");
    }
}
