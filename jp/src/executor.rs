//! Job executors
//!
//! An executor performs the work behind one attempt. The pool races it
//! against the attempt timeout and drops the future when time runs out, so an
//! executor is cancelled at its next await point.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use rand::Rng;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{ExecutorConfig, ExecutorKind};

/// Performs the unit of work for a claimed job
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run one attempt. `identity` is `name:id`, `payload` the job data.
    async fn execute(&self, identity: &str, payload: &[u8]) -> Result<()>;
}

/// Placeholder workload: random failures and random durations
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    error_probability: f64,
    max_duration: Duration,
}

impl SimulatedExecutor {
    pub fn new(error_probability: f64, max_duration: Duration) -> Self {
        Self {
            error_probability,
            max_duration,
        }
    }
}

#[async_trait]
impl JobExecutor for SimulatedExecutor {
    async fn execute(&self, identity: &str, _payload: &[u8]) -> Result<()> {
        // ThreadRng is not Send, so draw everything before the first await
        let (fail, work) = {
            let mut rng = rand::rng();
            let fail = rng.random::<f64>() < self.error_probability;
            let max_ms = self.max_duration.as_millis() as u64;
            let work = if max_ms == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rng.random_range(0..max_ms))
            };
            (fail, work)
        };

        info!(%identity, "Started job");
        if fail {
            return Err(eyre!("simulated failure for {}", identity));
        }

        tokio::time::sleep(work).await;
        info!(%identity, elapsed_ms = work.as_millis() as u64, "Finished job");
        Ok(())
    }
}

/// Runs a shell command per attempt
///
/// The child sees `JOB_IDENTITY` and `JOB_NAME` in its environment and is
/// killed if the attempt future is dropped.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    command: String,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    async fn execute(&self, identity: &str, payload: &[u8]) -> Result<()> {
        debug!(%identity, command = %self.command, "ShellExecutor::execute: called");
        let name = String::from_utf8_lossy(payload);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("JOB_IDENTITY", identity)
            .env("JOB_NAME", name.as_ref())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to spawn job command")?;

        if output.status.success() {
            debug!(%identity, "ShellExecutor::execute: command succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(eyre!("command exited with {}: {}", output.status, stderr.trim()))
        }
    }
}

/// Build the executor named by the configuration
pub fn build_executor(config: &ExecutorConfig) -> Result<Arc<dyn JobExecutor>> {
    debug!(?config.kind, "build_executor: called");
    config.validate()?;
    match config.kind {
        ExecutorKind::Simulated => Ok(Arc::new(SimulatedExecutor::new(
            config.error_probability,
            Duration::from_millis(config.max_duration_ms),
        ))),
        ExecutorKind::Shell => {
            let command = config
                .command
                .clone()
                .ok_or_else(|| eyre!("shell executor needs a command"))?;
            Ok(Arc::new(ShellExecutor::new(command)))
        }
    }
}
