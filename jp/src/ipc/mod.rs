//! Control channel between the jp CLI and the daemon
//!
//! Unix Domain Socket carrying one newline-terminated JSON request and one
//! JSON response per connection.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;

pub use client::DaemonClient;
pub use listener::{cleanup_socket, create_listener_at, read_message, send_response};
pub use messages::{DaemonMessage, DaemonResponse};

/// Maximum size of a single request or response line
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Get the default socket path for daemon IPC
///
/// Uses the same base directory as the PID and version files.
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("jobpool")
        .join("daemon.sock")
}

/// Socket path from config, falling back to the default
pub fn resolve_socket_path(configured: Option<&PathBuf>) -> PathBuf {
    configured.cloned().unwrap_or_else(get_socket_path)
}
