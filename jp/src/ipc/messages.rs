//! IPC message types for daemon communication
//!
//! Simple JSON-over-newline protocol. Each message is a single line of JSON followed by `\n`.

use jobstore::JobStatusDoc;
use serde::{Deserialize, Serialize};

use crate::scheduler::PoolStats;

/// Messages from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Queue a new job
    SubmitJob { name: String, score: f64 },

    /// Look up one job
    JobStatus { id: String },

    /// Suspend workers and attempts
    Pause,

    /// Release paused workers and attempts
    Resume,

    /// Drop all admission reservations
    ResetWindow,

    /// Fetch pool statistics
    Stats,

    /// Ping to check if daemon is alive
    Ping,

    /// Request daemon to stop gracefully
    Shutdown,
}

/// Responses from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    /// Acknowledgment
    Ok,

    /// Job accepted
    Submitted { id: String },

    /// Job status document
    Status { job: JobStatusDoc },

    /// Pool statistics
    Stats { stats: PoolStats },

    /// Pong response to ping
    Pong { version: String },

    /// Error response
    Error { message: String },
}
