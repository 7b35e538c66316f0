//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::daemon::DaemonManager;

/// JobPool - rate-limited worker pool for queued jobs
#[derive(Parser)]
#[command(
    name = "jp",
    about = "Rate-limited worker pool that claims, runs and retries queued jobs",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the jobpool daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Internal: Run as daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,

    /// Queue a job for the running pool
    Submit {
        /// Job name
        name: String,

        /// Priority score (lower runs first)
        #[arg(allow_negative_numbers = true)]
        score: f64,
    },

    /// Show one job's status
    Status {
        /// Job ID
        id: String,
    },

    /// Suspend claiming and attempts
    Pause,

    /// Resume a paused pool
    Resume,

    /// Drop every admission reservation in the current window
    ResetWindow,

    /// Show pool statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show daemon logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
}

/// Daemon management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Ping the daemon to check if it's alive and responsive
    Ping,
}

/// Path of the daemon log file
pub fn get_log_path() -> PathBuf {
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobpool")
        .join("logs")
        .join("jobpool.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Daemon state and log location shown under `--help`
pub fn generate_after_help() -> String {
    let daemon_running = DaemonManager::new().is_running();
    let (icon, state) = if daemon_running {
        ("\u{2705}", "running")
    } else {
        ("\u{274C}", "stopped")
    };

    format!(
        "Daemon:\n  {} {}\n\nLogs are written to: {}\n",
        icon,
        state,
        get_log_path().display()
    )
}

/// Output format for status and stats commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}. Use text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}
