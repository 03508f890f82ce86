//! sdqctl CLI entry point.
//!
//! A thin composition layer: parse arguments, initialize the application,
//! route the command, and map failures to exit codes.

use clap::Parser;

use sdqctl::app::{handle_fatal_error, initialize_app, AppConfig};
use sdqctl::cli::{execute_command, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let app_config = AppConfig::new(cli.verbose);
    initialize_app(&app_config);

    if let Err(e) = execute_command(cli).await {
        handle_fatal_error(e);
    }
}
