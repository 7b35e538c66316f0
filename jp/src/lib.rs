//! JobPool - rate-limited worker pool for queued jobs
//!
//! Workers claim the lowest-score pending job from a [`jobstore::JobStore`],
//! reserve a slot in the current admission window, and run the job through a
//! [`JobExecutor`] with a per-attempt timeout and a bounded number of retries.
//! Each job is settled exactly once as completed or failed.
//!
//! # Core Concepts
//!
//! - **Admission window**: at most `job-limit` slots are held at a time; a
//!   finished attempt leaves a hint and each window tick returns one slot
//!   per hint
//! - **Pause gate**: pausing stops both claiming and new attempts; in-flight
//!   attempts finish
//! - **Graceful stop**: workers stop claiming, running attempts drain, jobs
//!   still waiting on a slot or the pause gate are marked failed, then the
//!   window loop ends
//!
//! # Modules
//!
//! - [`scheduler`] - Lifecycle, worker loops and the window loop
//! - [`attempt`] - Retry loop for a single claimed job
//! - [`admission`] - Windowed slot accounting
//! - [`gate`] - Pause/resume gate
//! - [`executor`] - Executor trait and built-in executors
//! - [`daemon`] - PID management and the daemon main routine
//! - [`ipc`] / [`server`] - Control socket used by the `jp` CLI

pub mod admission;
pub mod attempt;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod gate;
pub mod ipc;
pub mod scheduler;
pub mod server;
pub mod service;

// Re-export commonly used types
pub use admission::{AdmissionController, AdmissionStats, WindowReport};
pub use attempt::{AttemptContext, JobOutcome, RetryPolicy, run_job};
pub use config::{Config, DaemonConfig, ExecutorConfig, ExecutorKind, PoolConfig, StorageBackend, StorageConfig};
pub use daemon::{DaemonManager, DaemonStatus};
pub use error::PoolError;
pub use executor::{JobExecutor, ShellExecutor, SimulatedExecutor, build_executor};
pub use gate::PauseGate;
pub use scheduler::{LifecycleState, PoolStats, Scheduler};
pub use service::{JobService, ServiceError};
