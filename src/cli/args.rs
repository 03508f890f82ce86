//! CLI argument structures.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Drive AI coding assistants through declarative, resumable workflow files
#[derive(Parser)]
#[command(name = "sdqctl")]
#[command(about = "sdqctl - drive assistant conversations from workflow files", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v debug, -vv trace, -vvv everything)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by `run` and `iterate`.
#[derive(Args, Debug, Default)]
pub struct ExecArgs {
    /// Workspace directory (defaults to the current directory)
    #[arg(short = 'p', long)]
    pub path: Option<PathBuf>,

    /// Maximum number of cycles
    #[arg(long)]
    pub max_cycles: Option<u32>,

    /// Session name (becomes part of the durable session id)
    #[arg(long)]
    pub session_name: Option<String>,

    /// Adapter to use
    #[arg(long)]
    pub adapter: Option<String>,

    /// Model id, overriding the workflow's selection
    #[arg(long)]
    pub model: Option<String>,

    /// Prologue files injected at each cycle start (repeatable)
    #[arg(long, value_name = "PATH")]
    pub prologue: Vec<PathBuf>,

    /// Execution mode: full, read-only or audit
    #[arg(long)]
    pub mode: Option<String>,

    /// Enable background compaction even without INFINITE-SESSIONS
    #[arg(long)]
    pub compact: bool,

    /// Percentage below which explicit COMPACT is skipped
    #[arg(long, value_name = "N")]
    pub compaction_min: Option<u8>,

    /// Percentage at which background compaction begins
    #[arg(long, value_name = "N")]
    pub compaction_threshold: Option<u8>,

    /// Percentage at which sends block until compaction
    #[arg(long, value_name = "N")]
    pub compaction_max: Option<u8>,

    /// Disable infinite sessions regardless of the workflow
    #[arg(long)]
    pub no_infinite_sessions: bool,

    /// Allow shell features (pipes, globs) in RUN commands
    #[arg(long)]
    pub allow_shell: bool,

    /// Emit the post-execution trace as JSON
    #[arg(long)]
    pub json: bool,

    /// Consume a rendered document instead of parsing the file ("-" reads
    /// stdin)
    #[arg(long, value_name = "SOURCE")]
    pub from_json: Option<String>,

    /// Treat validation findings as errors
    #[arg(long, conflicts_with = "lenient")]
    pub strict: bool,

    /// Downgrade validation findings to warnings
    #[arg(long)]
    pub lenient: bool,

    /// Template variables as KEY=VALUE (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Read a JSON object of template variables from stdin
    #[arg(long)]
    pub vars_stdin: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute exactly one cycle of a workflow
    Run {
        /// Workflow file to execute
        workflow: PathBuf,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Execute a workflow for one or more cycles
    Iterate {
        /// Workflow file to execute
        workflow: PathBuf,

        /// Number of cycles to run
        #[arg(short = 'n', value_name = "N")]
        cycles: Option<u32>,

        #[command(flatten)]
        exec: ExecArgs,
    },

    /// Validate a workflow without contacting an adapter
    Validate {
        workflow: PathBuf,

        /// Workspace directory
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,

        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,

        /// Downgrade missing context to warnings
        #[arg(long)]
        allow_missing: bool,

        /// Exclude matching files from context resolution (repeatable)
        #[arg(long, value_name = "GLOB")]
        exclude: Vec<String>,
    },

    /// Emit the resolved workflow as a versioned document
    Render {
        workflow: PathBuf,

        /// Compact single-line JSON instead of pretty-printed
        #[arg(long)]
        json: bool,
    },

    /// Show the parsed workflow in human-readable form
    Show { workflow: PathBuf },

    /// Inspect and manage stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },

    /// Run a verifier against the workspace
    Verify {
        /// Verifier kind (refs, links, traceability, terminology,
        /// assertions, coverage)
        kind: String,

        /// Verifier arguments
        args: Vec<String>,

        /// Workspace directory
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,
    },

    /// Report adapter availability, authentication and models
    Status {
        /// Adapter to query
        #[arg(long)]
        adapter: Option<String>,

        /// List available models
        #[arg(long)]
        models: bool,

        /// Show authentication state
        #[arg(long)]
        auth: bool,

        /// Show everything
        #[arg(long)]
        all: bool,
    },

    /// Inspect workspace plugin directives
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },
}

#[derive(Subcommand)]
pub enum SessionsCommands {
    /// List stored sessions
    List,

    /// Show one session's checkpoint and metrics
    Show { session_id: String },

    /// Delete a stored session
    Delete { session_id: String },

    /// Remove sessions older than a duration
    Cleanup {
        /// Age cutoff, e.g. "7d" or "36h"
        #[arg(long, value_name = "DURATION")]
        older_than: String,

        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a paused or consulting session
    Resume {
        session_id: String,

        /// Consultation answer or extra prompt context
        #[arg(long)]
        prompt: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum PluginCommands {
    /// List directives declared by the workspace manifest
    List {
        /// Workspace directory
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,
    },

    /// Validate a plugin manifest file
    Validate { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_iterate_flags() {
        let cli = Cli::parse_from([
            "sdqctl",
            "iterate",
            "wf.flow",
            "-n",
            "3",
            "--compaction-threshold",
            "85",
            "--var",
            "option=A",
            "--allow-shell",
        ]);
        match cli.command {
            Commands::Iterate { cycles, exec, .. } => {
                assert_eq!(cycles, Some(3));
                assert_eq!(exec.compaction_threshold, Some(85));
                assert_eq!(exec.vars, vec!["option=A"]);
                assert!(exec.allow_shell);
            }
            _ => panic!("expected iterate"),
        }
    }

    #[test]
    fn test_sessions_cleanup_flags() {
        let cli = Cli::parse_from([
            "sdqctl",
            "sessions",
            "cleanup",
            "--older-than",
            "7d",
            "--dry-run",
        ]);
        match cli.command {
            Commands::Sessions {
                command: SessionsCommands::Cleanup { older_than, dry_run },
            } => {
                assert_eq!(older_than, "7d");
                assert!(dry_run);
            }
            _ => panic!("expected sessions cleanup"),
        }
    }

    #[test]
    fn test_strict_lenient_conflict() {
        let result = Cli::try_parse_from(["sdqctl", "run", "wf.flow", "--strict", "--lenient"]);
        assert!(result.is_err());
    }
}
