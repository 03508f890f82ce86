//! Command-line interface: argument structures and the command router.

pub mod args;
pub mod router;

pub use args::{Cli, Commands, ExecArgs, PluginCommands, SessionsCommands};
pub use router::execute_command;
