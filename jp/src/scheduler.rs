//! Worker pool scheduler
//!
//! Owns the worker loops, the window loop and the start/stop lifecycle.
//!
//! ```text
//!             claim           acquire          spawn
//!  worker ──► store ──► admission ──► attempt task ──► settle
//!     ▲                     ▲
//!     └── pause gate        └── window loop (reconcile every job-interval)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jobstore::JobStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, AdmissionStats};
use crate::attempt::{AttemptContext, PoolCounters, RetryPolicy, abandon, report, run_tracked};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::executor::JobExecutor;
use crate::gate::PauseGate;

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub state: LifecycleState,
    pub paused: bool,
    pub workers: usize,
    pub admission: AdmissionStats,
    /// Attempt tasks not yet finished
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub settle_failures: u64,
    pub total_attempts: u64,
}

/// Handles for the tasks spawned by `start`
struct RunHandles {
    /// Stops worker loops
    workers_token: CancellationToken,
    /// Stops the window loop, raised only after attempts drain
    window_token: CancellationToken,
    workers: TaskTracker,
    window: JoinHandle<()>,
}

/// The worker pool
pub struct Scheduler {
    config: PoolConfig,
    ctx: Arc<AttemptContext>,
    attempts: TaskTracker,
    state: Mutex<LifecycleState>,
    handles: Mutex<Option<RunHandles>>,
}

impl Scheduler {
    /// Create a scheduler; the configuration is validated here
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self, PoolError> {
        debug!(?config, "Scheduler::new: called");
        config.validate()?;

        let ctx = Arc::new(AttemptContext {
            store,
            executor,
            admission: Arc::new(AdmissionController::new(config.job_limit)),
            gate: Arc::new(PauseGate::new()),
            counters: Arc::new(PoolCounters::default()),
            policy: RetryPolicy::from(&config),
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            config,
            ctx,
            attempts: TaskTracker::new(),
            state: Mutex::new(LifecycleState::Created),
            handles: Mutex::new(None),
        })
    }

    /// Spawn the window loop and the worker loops
    pub async fn start(&self) -> Result<(), PoolError> {
        debug!("Scheduler::start: called");
        let mut state = self.state.lock().await;
        if *state != LifecycleState::Created {
            return Err(PoolError::InvalidState {
                expected: LifecycleState::Created,
                actual: *state,
            });
        }

        // Shared with attempts, so retries parked on a slot or the gate see it too
        let workers_token = self.ctx.shutdown.clone();
        let window_token = CancellationToken::new();

        let window = tokio::spawn(window_loop(
            self.ctx.admission.clone(),
            self.config.job_interval(),
            window_token.clone(),
        ));

        let workers = TaskTracker::new();
        for worker_id in 0..self.config.workers {
            workers.spawn(worker_loop(
                worker_id,
                self.ctx.clone(),
                self.attempts.clone(),
                workers_token.clone(),
                self.config.claim_backoff(),
            ));
        }
        workers.close();

        *self.handles.lock().await = Some(RunHandles {
            workers_token,
            window_token,
            workers,
            window,
        });
        *state = LifecycleState::Running;
        info!(workers = self.config.workers, job_limit = self.config.job_limit, "Scheduler started");
        Ok(())
    }

    /// Stop claiming, drain in-flight attempts, then stop the window loop
    ///
    /// A running attempt is not cancelled, so this waits for the executor to
    /// return or time out. Jobs waiting on a slot or on the pause gate are
    /// marked failed instead of waiting.
    pub async fn stop(&self) -> Result<(), PoolError> {
        debug!("Scheduler::stop: called");
        let handles = {
            let mut state = self.state.lock().await;
            if *state != LifecycleState::Running {
                return Err(PoolError::InvalidState {
                    expected: LifecycleState::Running,
                    actual: *state,
                });
            }
            *state = LifecycleState::Stopping;
            self.handles.lock().await.take()
        };
        info!("Scheduler stopping");

        if let Some(handles) = handles {
            handles.workers_token.cancel();
            handles.workers.wait().await;
            debug!("Scheduler::stop: worker loops finished");

            self.attempts.close();
            self.attempts.wait().await;
            debug!("Scheduler::stop: attempts drained");

            handles.window_token.cancel();
            if let Err(e) = handles.window.await {
                warn!(error = %e, "Window loop ended abnormally");
            }
        }

        *self.state.lock().await = LifecycleState::Stopped;
        info!("Scheduler stopped");
        Ok(())
    }

    pub fn pause(&self) -> bool {
        self.ctx.gate.pause()
    }

    pub fn unpause(&self) -> bool {
        self.ctx.gate.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.gate.is_paused()
    }

    /// Clear the admission window, restoring full capacity
    pub async fn reset_window(&self) -> usize {
        self.ctx.admission.reset_window().await
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.ctx.store.clone()
    }

    pub async fn stats(&self) -> PoolStats {
        debug!("Scheduler::stats: called");
        let counts = self.ctx.counters.snapshot();
        PoolStats {
            state: self.state().await,
            paused: self.is_paused(),
            workers: self.config.workers,
            admission: self.ctx.admission.snapshot().await,
            in_flight: self.attempts.len(),
            completed: counts.completed,
            failed: counts.failed,
            settle_failures: counts.settle_failures,
            total_attempts: counts.attempts,
        }
    }
}

/// Sleep for `delay` unless shutdown comes first; returns false on shutdown
async fn backoff(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<AttemptContext>,
    attempts: TaskTracker,
    shutdown: CancellationToken,
    claim_backoff: Duration,
) {
    debug!(worker_id, "worker_loop: started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ctx.gate.wait_if_paused() => {}
        }

        // The claim itself is not raced against shutdown: a store may commit
        // the claim even if this future is dropped
        let job = match ctx.store.claim_next().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                if !backoff(claim_backoff, &shutdown).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(worker_id, error = %e, "Failed to claim job");
                if !backoff(claim_backoff, &shutdown).await {
                    break;
                }
                continue;
            }
        };

        debug!(worker_id, job_id = %job.id, score = job.score, "worker_loop: claimed job");
        if !ctx.acquire_or_shutdown().await {
            let outcome = abandon(&ctx, &job, 0).await;
            report(&ctx, &job, &outcome);
            break;
        }
        attempts.spawn(run_tracked(ctx.clone(), job));
    }
    debug!(worker_id, "worker_loop: exiting");
}

async fn window_loop(admission: Arc<AdmissionController>, interval: Duration, shutdown: CancellationToken) {
    debug!(?interval, "window_loop: started");
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = admission.reconcile().await;
                info!(
                    reclaimed = report.reclaimed,
                    reserved = report.reserved,
                    pending_hints = report.pending_hints,
                    attempts = report.attempts_in_window,
                    "Window reconciled"
                );
            }
        }
    }
    debug!("window_loop: exiting");
}
