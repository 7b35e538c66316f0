//! Daemon process management and the daemon's main routine
//!
//! `DaemonManager` owns the PID/version files and spawns or signals the
//! background process. `serve` runs the pool and control server in-process
//! until shutdown is requested.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use jobstore::{InMemoryStore, JobStore, SqliteStore};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StorageBackend, StorageConfig};
use crate::executor::build_executor;
use crate::ipc::{cleanup_socket, create_listener_at};
use crate::scheduler::Scheduler;
use crate::server::ControlServer;

/// Version reported over IPC and written to the version file
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Base directory for runtime files (PID, version, socket)
fn runtime_base() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("jobpool")
}

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
    version_file: PathBuf,
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonManager {
    /// Manager using the default runtime directory
    pub fn new() -> Self {
        Self::with_pid_file(runtime_base().join("jobpool.pid"))
    }

    /// Manager with a custom PID file; the version file sits next to it
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        let version_file = pid_file.with_extension("version");
        Self { pid_file, version_file }
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// PID of the daemon, if the PID file names a live process
    pub fn running_pid(&self) -> Option<u32> {
        let result = self.read_pid().filter(|&pid| is_process_running(pid));
        debug!(?result, "DaemonManager::running_pid: returning");
        result
    }

    fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid_file).ok()?.trim().parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.pid_file, "DaemonManager::write_pid: called");
        write_file(&self.pid_file, &pid.to_string()).context("Failed to write PID file")
    }

    fn remove_pid_file(&self) -> Result<()> {
        remove_if_exists(&self.pid_file).context("Failed to remove PID file")
    }

    fn write_version(&self, version: &str) -> Result<()> {
        write_file(&self.version_file, version).context("Failed to write version file")
    }

    pub fn read_version(&self) -> Option<String> {
        fs::read_to_string(&self.version_file)
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn remove_version_file(&self) -> Result<()> {
        remove_if_exists(&self.version_file).context("Failed to remove version file")
    }

    /// Whether the running daemon was built from this version
    pub fn version_matches(&self) -> bool {
        let matches = self.read_version().is_some_and(|v| v == VERSION);
        debug!(matches, cli_version = VERSION, "DaemonManager::version_matches: checked");
        matches
    }

    /// Spawn `jp run-daemon` in the background and return its PID
    pub fn start(&self, config_path: Option<&Path>) -> Result<u32> {
        debug!(?config_path, "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        info!("Starting daemon...");
        let exe = std::env::current_exe().context("Failed to get current executable")?;

        let mut cmd = Command::new(&exe);
        if let Some(path) = config_path {
            cmd.arg("--config").arg(path);
        }
        let child = cmd
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Send SIGTERM, wait up to `grace`, then SIGKILL
    pub fn stop(&self, grace: Duration) -> Result<()> {
        debug!(?grace, "DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon...");
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;

        let deadline = std::time::Instant::now() + grace;
        while is_process_running(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }

        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }

        self.remove_pid_file()?;
        self.remove_version_file()?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Record the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        self.write_version(VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Remove PID and version files after a clean exit
    pub fn unregister(&self) -> Result<()> {
        self.remove_pid_file()?;
        self.remove_version_file()
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
            version: self.read_version(),
        }
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create runtime directory")?;
    }
    fs::write(path, contents)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
        debug!(?path, "Removed file");
    }
    Ok(())
}

/// Signal 0 probes for the process without touching it
fn is_process_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    pub version: Option<String>,
}

/// Open the job store named by the configuration
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn JobStore>> {
    debug!(?config.backend, "open_store: called");
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        StorageBackend::Sqlite => {
            let store = SqliteStore::open(&config.path)
                .context(format!("Failed to open job store at {}", config.path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// Run the pool and control server until `shutdown` is cancelled
///
/// Shutdown may come from the caller (signals) or from an IPC request. The
/// pool is then drained for at most `daemon.shutdown-timeout-ms`.
pub async fn serve(config: &Config, socket_path: &Path, shutdown: CancellationToken) -> Result<()> {
    debug!(?socket_path, "serve: called");
    config.validate()?;

    let store = open_store(&config.storage)?;
    let executor = build_executor(&config.executor)?;
    let scheduler = Arc::new(Scheduler::new(config.pool.clone(), store, executor)?);

    let (listener, socket_path) = create_listener_at(socket_path)?;
    info!(?socket_path, "IPC socket listening");

    let server = Arc::new(ControlServer::new(scheduler.clone(), shutdown.clone()));
    let server_handle = tokio::spawn(server.run(listener));

    scheduler.start().await?;
    info!("Daemon running");

    shutdown.cancelled().await;
    info!("Daemon shutting down...");

    let timeout = config.daemon.shutdown_timeout();
    match tokio::time::timeout(timeout, scheduler.stop()).await {
        Ok(Ok(())) => info!("Pool drained"),
        Ok(Err(e)) => error!(error = %e, "Failed to stop pool"),
        Err(_) => {
            let stats = scheduler.stats().await;
            warn!(?timeout, in_flight = stats.in_flight, "Shutdown timeout expired with attempts in flight");
        }
    }

    let _ = server_handle.await;
    cleanup_socket(&socket_path);
    debug!("serve: shutdown complete");
    Ok(())
}
