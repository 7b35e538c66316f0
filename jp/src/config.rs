//! JobPool configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Main JobPool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Worker pool settings
    pub pool: PoolConfig,

    /// Job store settings
    pub storage: StorageConfig,

    /// Job executor settings
    pub executor: ExecutorConfig,

    /// Daemon settings
    pub daemon: DaemonConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        self.pool.validate().context("Invalid pool configuration")?;
        self.executor.validate().context("Invalid executor configuration")?;
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .jobpool.yml
        let local_config = PathBuf::from(".jobpool.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/jobpool/jobpool.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("jobpool").join("jobpool.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialized
    ///
    /// Errors are swallowed; the full load reports them later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker loops claiming jobs
    pub workers: usize,

    /// Admission slots per rate window
    #[serde(rename = "job-limit")]
    pub job_limit: usize,

    /// Rate window length in milliseconds
    #[serde(rename = "job-interval-ms")]
    pub job_interval_ms: u64,

    /// Attempts allowed after the first one
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Per-attempt timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Pause between a failed attempt and its retry
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    /// Sleep after an empty (or failed) claim
    #[serde(rename = "claim-backoff-ms")]
    pub claim_backoff_ms: u64,

    /// Emit a release hint for jobs that exhaust their retries
    #[serde(rename = "reclaim-exhausted")]
    pub reclaim_exhausted: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            job_limit: 100,
            job_interval_ms: 60_000,
            max_retries: 3,
            timeout_ms: 3_000,
            retry_delay_ms: 1,
            claim_backoff_ms: 100,
            reclaim_exhausted: false,
        }
    }
}

impl PoolConfig {
    /// Reject non-positive values
    pub fn validate(&self) -> Result<(), PoolError> {
        let checks: [(&'static str, u64); 7] = [
            ("workers", self.workers as u64),
            ("job-limit", self.job_limit as u64),
            ("job-interval-ms", self.job_interval_ms),
            ("max-retries", self.max_retries as u64),
            ("timeout-ms", self.timeout_ms),
            ("retry-delay-ms", self.retry_delay_ms),
            ("claim-backoff-ms", self.claim_backoff_ms),
        ];

        for (field, value) in checks {
            if value == 0 {
                return Err(PoolError::InvalidConfig {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_millis(self.job_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn claim_backoff(&self) -> Duration {
        Duration::from_millis(self.claim_backoff_ms)
    }
}

/// Which job store backs the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database path
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: jobstore::config::default_store_path(),
        }
    }
}

/// Which executor runs claimed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Simulated,
    Shell,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,

    /// Chance that a simulated attempt fails outright
    #[serde(rename = "error-probability")]
    pub error_probability: f64,

    /// Upper bound on simulated work time
    #[serde(rename = "max-duration-ms")]
    pub max_duration_ms: u64,

    /// Shell command run for each attempt (shell executor only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Simulated,
            error_probability: 0.1,
            max_duration_ms: 3_000,
            command: None,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if !(0.0..=1.0).contains(&self.error_probability) {
            return Err(PoolError::InvalidConfig {
                field: "error-probability",
                reason: format!("{} is outside [0, 1]", self.error_probability),
            });
        }

        if self.kind == ExecutorKind::Shell && self.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
            return Err(PoolError::InvalidConfig {
                field: "command",
                reason: "shell executor needs a command".to_string(),
            });
        }
        Ok(())
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Upper bound on draining in-flight attempts at shutdown
    #[serde(rename = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: u64,

    /// Override for the control socket path
    #[serde(rename = "socket-path", skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 30_000,
            socket_path: None,
        }
    }
}

impl DaemonConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
