//! JobPool - rate-limited worker pool
//!
//! CLI entry point for running the pool daemon and talking to it.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, FromArgMatches};
use colored::*;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobpool::cli::{Cli, Command, DaemonCommand, OutputFormat, generate_after_help, get_log_path};
use jobpool::config::Config;
use jobpool::daemon::{self, DaemonManager};
use jobpool::ipc::{self, DaemonClient};
use jobpool::scheduler::PoolStats;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    // Client commands share the daemon's log file, so append rather than truncate
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let client = DaemonClient::with_socket_path(ipc::resolve_socket_path(config.daemon.socket_path.as_ref()));

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Daemon { command }) => match command {
            DaemonCommand::Start { foreground } => cmd_start(&config, cli.config.as_ref(), foreground).await,
            DaemonCommand::Stop => cmd_stop(&config, &client).await,
            DaemonCommand::Status { format } => cmd_daemon_status(format),
            DaemonCommand::Ping => cmd_ping(&client).await,
        },
        Some(Command::RunDaemon) => run_daemon(&config).await,
        Some(Command::Submit { name, score }) => cmd_submit(&client, &name, score).await,
        Some(Command::Status { id }) => cmd_job_status(&client, &id).await,
        Some(Command::Pause) => {
            client.pause().await?;
            println!("{} Pool paused", "✓".green());
            Ok(())
        }
        Some(Command::Resume) => {
            client.resume().await?;
            println!("{} Pool resumed", "✓".green());
            Ok(())
        }
        Some(Command::ResetWindow) => {
            client.reset_window().await?;
            println!("{} Admission window reset", "✓".green());
            Ok(())
        }
        Some(Command::Stats { format }) => cmd_stats(&client, format).await,
        Some(Command::Logs { follow, lines }) => cmd_logs(follow, lines),
        None => {
            Cli::command().after_help(generate_after_help()).print_help()?;
            Ok(())
        }
    }
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<&PathBuf>, foreground: bool) -> Result<()> {
    debug!(foreground, "cmd_start: called");
    let daemon = DaemonManager::new();

    if let Some(pid) = daemon.running_pid() {
        println!("JobPool is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting JobPool in foreground mode...");
        run_daemon(config).await
    } else {
        let pid = daemon.start(config_path.map(PathBuf::as_path))?;
        println!("{} JobPool started (PID: {})", "✓".green(), pid);
        Ok(())
    }
}

/// Stop the daemon
///
/// Asks over IPC first so in-flight attempts can drain, then falls back to signals.
async fn cmd_stop(config: &Config, client: &DaemonClient) -> Result<()> {
    debug!("cmd_stop: called");
    let daemon = DaemonManager::new();

    let Some(pid) = daemon.running_pid() else {
        println!("JobPool is not running");
        return Ok(());
    };

    let grace = config.daemon.shutdown_timeout() + Duration::from_secs(5);

    if client.socket_exists() {
        match client.shutdown().await {
            Ok(()) => {
                let deadline = tokio::time::Instant::now() + grace;
                while daemon.is_running() && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                if !daemon.is_running() {
                    println!("{} JobPool stopped gracefully (was PID: {})", "✓".green(), pid);
                    return Ok(());
                }
                debug!("cmd_stop: IPC shutdown timed out, falling back to SIGTERM");
            }
            Err(e) => {
                debug!(error = %e, "cmd_stop: IPC shutdown failed, falling back to SIGTERM");
            }
        }
    }

    daemon.stop(grace)?;
    println!("{} JobPool stopped (was PID: {})", "✓".green(), pid);
    Ok(())
}

/// Ping the daemon to check it is alive and responsive
async fn cmd_ping(client: &DaemonClient) -> Result<()> {
    debug!("cmd_ping: called");
    if !DaemonManager::new().is_running() {
        println!("JobPool is not running");
        return Ok(());
    }

    if !client.socket_exists() {
        println!("Daemon PID file exists but IPC socket not found");
        println!("The daemon may be starting up or in an inconsistent state");
        return Ok(());
    }

    match client.ping().await {
        Ok(version) => {
            println!("Daemon is alive and responsive");
            println!("Version: {}", version);
            if version != daemon::VERSION {
                println!(
                    "{} CLI version {} differs from daemon version",
                    "!".yellow(),
                    daemon::VERSION
                );
            }
        }
        Err(e) => {
            println!("Daemon PID file exists but not responding to IPC");
            println!("Error: {}", e);
        }
    }
    Ok(())
}

/// Show whether the daemon process is running
fn cmd_daemon_status(format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_daemon_status: called");
    let status = DaemonManager::new().status();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "pid_file": status.pid_file.to_string_lossy(),
                "version": status.version,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("{}", "JobPool Status".bold());
            println!("--------------");
            match status.pid {
                Some(pid) => {
                    println!("Status: {}", "running".green());
                    println!("PID: {}", pid);
                }
                None => println!("Status: {}", "stopped".red()),
            }
            if let Some(version) = status.version {
                println!("Version: {}", version);
            }
            println!("PID file: {}", status.pid_file.display());
        }
    }
    Ok(())
}

async fn cmd_submit(client: &DaemonClient, name: &str, score: f64) -> Result<()> {
    debug!(%name, score, "cmd_submit: called");
    let id = client.submit(name, score).await?;
    println!("{} Submitted job: {}", "✓".green(), id);
    Ok(())
}

async fn cmd_job_status(client: &DaemonClient, id: &str) -> Result<()> {
    debug!(%id, "cmd_job_status: called");
    let doc = client.job_status(id).await?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn cmd_stats(client: &DaemonClient, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_stats: called");
    let stats = client.stats().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => print_stats(&stats),
    }
    Ok(())
}

fn print_stats(stats: &PoolStats) {
    let paused = if stats.paused {
        "paused".yellow()
    } else {
        "active".green()
    };
    println!("{}", "Pool".bold());
    println!("  state:            {} ({})", stats.state, paused);
    println!("  workers:          {}", stats.workers);
    println!("  in flight:        {}", stats.in_flight);
    println!("{}", "Admission".bold());
    println!(
        "  reserved:         {}/{}",
        stats.admission.reserved, stats.admission.limit
    );
    println!("  pending hints:    {}", stats.admission.pending_hints);
    println!("  window attempts:  {}", stats.admission.attempts_in_window);
    println!("  total acquired:   {}", stats.admission.total_acquired);
    println!("  total reclaimed:  {}", stats.admission.total_reclaimed);
    println!("{}", "Jobs".bold());
    println!("  completed:        {}", stats.completed.to_string().green());
    println!("  failed:           {}", stats.failed.to_string().red());
    println!("  settle failures:  {}", stats.settle_failures);
    println!("  attempts:         {}", stats.total_attempts);
}

/// Show daemon logs
fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    debug!(follow, lines, "cmd_logs: called");
    let log_path = get_log_path();

    if !log_path.exists() {
        println!("No log file found at: {}", log_path.display());
        println!("The daemon may not have been started yet.");
        return Ok(());
    }

    if follow {
        println!("Following log file: {} (Ctrl+C to stop)", log_path.display());
        println!();
        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&log_path)
            .spawn()
            .context("Failed to run tail -f")?;
        child.wait()?;
    } else {
        let file = fs::File::open(&log_path).context("Failed to open log file")?;
        let all_lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }
    Ok(())
}

/// Run the daemon in this process until SIGINT, SIGTERM or an IPC shutdown
async fn run_daemon(config: &Config) -> Result<()> {
    debug!("run_daemon: called");
    info!("Daemon starting...");

    config.validate().context("Invalid configuration")?;

    let manager = DaemonManager::new();
    manager.register_self()?;

    let shutdown = CancellationToken::new();
    let socket_path = ipc::resolve_socket_path(config.daemon.socket_path.as_ref());
    let serve_config = config.clone();
    let serve_token = shutdown.clone();
    let mut serve_handle =
        tokio::spawn(async move { daemon::serve(&serve_config, &socket_path, serve_token).await });

    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    // serve returns on its own after an IPC shutdown or a startup error
    let finished = tokio::select! {
        _ = sigint.recv() => {
            warn!("SIGINT received");
            None
        }
        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            None
        }
        joined = &mut serve_handle => Some(joined),
    };

    let result = match finished {
        Some(joined) => joined,
        None => {
            shutdown.cancel();
            serve_handle.await
        }
    };

    if let Err(e) = manager.unregister() {
        warn!(error = %e, "Failed to remove PID files");
    }

    result.context("Daemon task panicked")??;
    info!("Daemon stopped");
    Ok(())
}
