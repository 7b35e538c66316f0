//! IPC client for communicating with the daemon

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use jobstore::JobStatusDoc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::messages::{DaemonMessage, DaemonResponse};
use super::{MAX_MESSAGE_SIZE, get_socket_path};
use crate::scheduler::PoolStats;

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for communicating with the daemon via IPC
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected(response: DaemonResponse) -> eyre::Report {
    match response {
        DaemonResponse::Error { message } => eyre::eyre!("Daemon error: {}", message),
        other => eyre::eyre!("Unexpected response: {:?}", other),
    }
}

impl DaemonClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(get_socket_path())
    }

    /// Create a client with a custom socket path
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Submit a job, returning its id
    pub async fn submit(&self, name: &str, score: f64) -> Result<String> {
        debug!(%name, score, "DaemonClient: submitting job");
        let msg = DaemonMessage::SubmitJob {
            name: name.to_string(),
            score,
        };
        match self.send_message(msg).await? {
            DaemonResponse::Submitted { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch a job's status document
    pub async fn job_status(&self, id: &str) -> Result<JobStatusDoc> {
        debug!(%id, "DaemonClient: fetching job status");
        let msg = DaemonMessage::JobStatus { id: id.to_string() };
        match self.send_message(msg).await? {
            DaemonResponse::Status { job } => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn pause(&self) -> Result<()> {
        debug!("DaemonClient: pausing pool");
        self.expect_ok(DaemonMessage::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        debug!("DaemonClient: resuming pool");
        self.expect_ok(DaemonMessage::Resume).await
    }

    pub async fn reset_window(&self) -> Result<()> {
        debug!("DaemonClient: resetting admission window");
        self.expect_ok(DaemonMessage::ResetWindow).await
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        debug!("DaemonClient: fetching stats");
        match self.send_message(DaemonMessage::Stats).await? {
            DaemonResponse::Stats { stats } => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Check if daemon is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("DaemonClient: pinging daemon");
        match self.send_message(DaemonMessage::Ping).await? {
            DaemonResponse::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon to shutdown gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("DaemonClient: requesting daemon shutdown");
        self.expect_ok(DaemonMessage::Shutdown).await
    }

    async fn expect_ok(&self, msg: DaemonMessage) -> Result<()> {
        match self.send_message(msg).await? {
            DaemonResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Send a message to the daemon and wait for response
    async fn send_message(&self, msg: DaemonMessage) -> Result<DaemonResponse> {
        debug!(?self.socket_path, ?msg, "DaemonClient: sending message");

        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")?;

        self.send_on_stream(stream, msg).await
    }

    async fn send_on_stream(&self, mut stream: UnixStream, msg: DaemonMessage) -> Result<DaemonResponse> {
        let msg_json = serde_json::to_string(&msg).context("Failed to serialize message")?;

        if msg_json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Message too large: {} bytes", msg_json.len()));
        }

        tokio::time::timeout(self.timeout, async {
            stream
                .write_all(msg_json.as_bytes())
                .await
                .context("Failed to write message")?;
            stream.write_all(b"\n").await.context("Failed to write newline")?;
            stream.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;

        let mut reader = BufReader::new(&mut stream).take(MAX_MESSAGE_SIZE as u64 + 1);
        let mut response_line = String::new();

        tokio::time::timeout(self.timeout, async {
            let bytes_read = reader
                .read_line(&mut response_line)
                .await
                .context("Failed to read response")?;

            if bytes_read > MAX_MESSAGE_SIZE {
                return Err(eyre::eyre!("Response too large: more than {} bytes", MAX_MESSAGE_SIZE));
            }

            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Read timeout")??;

        let response: DaemonResponse =
            serde_json::from_str(response_line.trim()).context("Failed to parse daemon response")?;

        debug!(?response, "DaemonClient: received response");
        Ok(response)
    }
}
