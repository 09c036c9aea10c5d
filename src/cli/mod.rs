//! CLI argument definitions for the issue tracker.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::processor::{DEFAULT_CONCURRENT_SLOTS, DEFAULT_REFRESH_INTERVAL_SECS};

/// Issue tracker - files issues on disk and lets a CLI coding agent work them.
///
/// Start the control plane with `issue-tracker serve --port 8090`; the other
/// commands work directly on the data directory.
#[derive(Parser, Debug)]
#[command(name = "issue-tracker")]
#[command(author, version, about = "Issue-tracking control plane that drives a CLI coding agent", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Scenario root: agent working directory, prompts, settings and transcripts
    #[arg(long, global = true, env = "ISSUE_TRACKER_SCENARIO_ROOT")]
    pub scenario_root: Option<PathBuf>,

    /// Issue store (default: <scenario-root>/data/issues)
    #[arg(long, global = true, env = "ISSUE_TRACKER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "ISSUE_TRACKER_LOG_JSON")]
    pub log_json: bool,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long, global = true, env = "ISSUE_TRACKER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API, WebSocket stream and processor loop
    Serve {
        /// Port to listen on (required)
        #[arg(short, long, env = "API_PORT")]
        port: Option<u16>,

        /// Host address to bind to (use 0.0.0.0 for network access)
        #[arg(long, env = "API_HOST", default_value = crate::config::DEFAULT_HOST)]
        host: String,

        /// Comma-separated origins allowed on the WebSocket stream (empty allows any)
        #[arg(long, env = "WEBSOCKET_ALLOWED_ORIGINS", default_value = "")]
        allowed_origins: String,

        /// Start with the processor admitting open issues
        #[arg(long)]
        processor_active: bool,

        /// Maximum agents running at once
        #[arg(long, default_value_t = DEFAULT_CONCURRENT_SLOTS)]
        concurrent_slots: usize,

        /// Seconds between processor cycles
        #[arg(long, default_value_t = DEFAULT_REFRESH_INTERVAL_SECS)]
        refresh_interval: u64,

        /// Stop admitting after this many issues
        #[arg(long)]
        max_issues: Option<u64>,
    },

    /// Issue management commands
    Issue {
        #[command(subcommand)]
        command: IssueCommands,
    },

    /// Show rate-limit status, releasing issues whose deadline passed
    RateLimit,

    /// Parse an agent transcript
    Transcript {
        /// Path relative to <scenario-root>/tmp or <scenario-root>
        path: String,

        /// Maximum records to read
        #[arg(long)]
        max: Option<usize>,
    },
}

/// Issue subcommands
#[derive(Subcommand, Debug)]
pub enum IssueCommands {
    /// Create a new issue in `open`
    Create {
        /// Issue title
        title: String,

        /// Longer description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Issue type, e.g. bug or feature
        #[arg(short = 't', long = "type", default_value = "bug")]
        issue_type: String,

        /// Priority, e.g. low, medium, high, critical
        #[arg(short, long, default_value = "medium")]
        priority: String,

        /// Application the issue belongs to
        #[arg(long, default_value = "")]
        app_id: String,

        /// Error message observed
        #[arg(long, default_value = "")]
        error_message: String,

        /// Reporter name
        #[arg(long)]
        reporter_name: Option<String>,

        /// Reporter email
        #[arg(long)]
        reporter_email: Option<String>,

        /// Tags (can be repeated)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Files to store as attachments (can be repeated)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },

    /// List issues, newest first
    List {
        /// Only issues in this status
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of issues
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show one issue
    Show {
        /// Issue ID (e.g., issue-1a2b3c4d)
        id: String,
    },

    /// Move an issue to another status
    Move {
        /// Issue ID
        id: String,

        /// Target status: open, active, waiting, completed, failed or archived
        status: String,
    },

    /// Delete an issue and its attachments
    Delete {
        /// Issue ID
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_port_is_optional_at_parse_time() {
        let cli = Cli::try_parse_from(["issue-tracker", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { concurrent_slots, .. } => assert_eq!(concurrent_slots, 2),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_issue_create_flags() {
        let cli = Cli::try_parse_from([
            "issue-tracker",
            "-H",
            "issue",
            "create",
            "Login fails",
            "--type",
            "bug",
            "--tag",
            "auth",
            "--tag",
            "login",
        ])
        .unwrap();
        assert!(cli.human_readable);
        match cli.command {
            Commands::Issue {
                command: IssueCommands::Create { title, tags, .. },
            } => {
                assert_eq!(title, "Login fails");
                assert_eq!(tags, vec!["auth", "login"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
