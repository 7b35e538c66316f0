//! CLI argument parsing for jobstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::JobStatus;

#[derive(Parser, Debug)]
#[command(name = "js")]
#[command(author, version, about = "Inspect and edit a jobpool job store", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the job database (overrides config)
    #[arg(short, long)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a pending job
    Add {
        /// Job name
        #[arg(required = true)]
        name: String,

        /// Priority score (lower runs first)
        #[arg(required = true, allow_negative_numbers = true)]
        score: f64,
    },

    /// Show a job's status document
    Status {
        /// Job ID
        #[arg(required = true)]
        id: String,
    },

    /// List jobs
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Claim the next pending job (marks it in progress)
    Claim,
}
