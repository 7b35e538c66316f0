//! Attempt pipeline for one claimed job
//!
//! Runs attempts strictly one after another. Each attempt holds an admission
//! slot, passes the pause gate, and races the executor against the timeout.
//! A failure with retries left emits a release hint and tries again; the
//! final outcome is written back to the store.
//!
//! Waits for a slot or for the pause gate give way to shutdown. A job whose
//! next attempt is stopped that way is settled as failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use jobstore::{Job, JobStore};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::executor::JobExecutor;
use crate::gate::PauseGate;

/// Retry and timeout settings for attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first
    pub max_retries: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
    /// Emit a hint when retries run out
    pub reclaim_exhausted: bool,
}

impl From<&PoolConfig> for RetryPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout: config.timeout(),
            retry_delay: config.retry_delay(),
            reclaim_exhausted: config.reclaim_exhausted,
        }
    }
}

/// How a job's attempt sequence ended
#[derive(Debug)]
pub enum JobOutcome {
    Completed { attempts: u32 },
    Failed { attempts: u32, error: PoolError },
    SettleFailed { attempts: u32, error: PoolError },
}

impl JobOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            JobOutcome::Completed { attempts }
            | JobOutcome::Failed { attempts, .. }
            | JobOutcome::SettleFailed { attempts, .. } => *attempts,
        }
    }
}

/// Running totals across all jobs
#[derive(Debug, Default)]
pub struct PoolCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    settle_failures: AtomicU64,
    attempts: AtomicU64,
}

/// Point-in-time copy of `PoolCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub settle_failures: u64,
    pub attempts: u64,
}

impl PoolCounters {
    pub fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Completed { .. } => &self.completed,
            JobOutcome::Failed { .. } => &self.failed,
            JobOutcome::SettleFailed { .. } => &self.settle_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
        }
    }
}

/// Everything an attempt sequence needs, shared across jobs
pub struct AttemptContext {
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<dyn JobExecutor>,
    pub admission: Arc<AdmissionController>,
    pub gate: Arc<PauseGate>,
    pub counters: Arc<PoolCounters>,
    pub policy: RetryPolicy,
    /// Raised by the scheduler when it stops
    pub shutdown: CancellationToken,
}

impl AttemptContext {
    /// Reserve a slot; returns false if shutdown came first
    ///
    /// A slot that is free right away is still taken after shutdown, so
    /// draining retries keep going while capacity lasts.
    pub async fn acquire_or_shutdown(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.admission.acquire() => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    /// Pass the pause gate; returns false if shutdown came first
    async fn pass_gate_or_shutdown(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.gate.wait_if_paused() => true,
            _ = self.shutdown.cancelled() => false,
        }
    }
}

/// Settle a claimed job whose next attempt was stopped by shutdown
pub async fn abandon(ctx: &AttemptContext, job: &Job, attempts: u32) -> JobOutcome {
    warn!(job_id = %job.id, attempts, "Shutdown before next attempt, marking job failed");
    if let Err(e) = ctx.store.mark_failed(&job.id).await {
        error!(job_id = %job.id, error = %e, "Failed to mark interrupted job failed");
        return JobOutcome::SettleFailed {
            attempts,
            error: e.into(),
        };
    }
    JobOutcome::Failed {
        attempts,
        error: PoolError::Interrupted { attempts },
    }
}

/// Run one attempt under the timeout
async fn run_once(ctx: &AttemptContext, identity: &str, payload: &[u8]) -> Result<(), PoolError> {
    match tokio::time::timeout(ctx.policy.timeout, ctx.executor.execute(identity, payload)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PoolError::Execution(format!("{:#}", e))),
        Err(_) => Err(PoolError::AttemptTimeout(ctx.policy.timeout)),
    }
}

/// Drive a claimed job to a terminal state
///
/// The caller must already hold the admission slot for the first attempt.
pub async fn run_job(ctx: &AttemptContext, job: &Job) -> JobOutcome {
    let identity = job.identity();
    debug!(job_id = %job.id, %identity, "run_job: called");

    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 && !ctx.acquire_or_shutdown().await {
            return abandon(ctx, job, attempt).await;
        }

        if !ctx.pass_gate_or_shutdown().await {
            // The slot held for this attempt goes unused
            ctx.admission.release_hint().await;
            return abandon(ctx, job, attempt).await;
        }

        attempt += 1;
        ctx.counters.record_attempt();
        debug!(job_id = %job.id, attempt, "run_job: attempt starting");

        match run_once(ctx, &identity, job.payload()).await {
            Ok(()) => {
                return match ctx.store.mark_completed(&job.id).await {
                    Ok(()) => {
                        ctx.admission.release_hint().await;
                        JobOutcome::Completed { attempts: attempt }
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                        JobOutcome::SettleFailed {
                            attempts: attempt,
                            error: e.into(),
                        }
                    }
                };
            }
            Err(e) if e.is_attempt_failure() && attempt <= ctx.policy.max_retries => {
                warn!(job_id = %job.id, attempt, error = %e, "Attempt failed, retrying");
                ctx.admission.release_hint().await;
                tokio::time::sleep(ctx.policy.retry_delay).await;
            }
            Err(e) => {
                warn!(job_id = %job.id, attempt, error = %e, "Attempt failed, no retries left");
                if let Err(store_err) = ctx.store.mark_failed(&job.id).await {
                    error!(job_id = %job.id, error = %store_err, "Failed to mark job failed");
                    return JobOutcome::SettleFailed {
                        attempts: attempt,
                        error: store_err.into(),
                    };
                }
                if ctx.policy.reclaim_exhausted {
                    ctx.admission.release_hint().await;
                }
                return JobOutcome::Failed {
                    attempts: attempt,
                    error: PoolError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    },
                };
            }
        }
    }
}

/// Run a job and log and count its outcome
pub async fn run_tracked(ctx: Arc<AttemptContext>, job: Job) {
    let outcome = run_job(&ctx, &job).await;
    report(&ctx, &job, &outcome);
}

/// Count and log a finished job
pub fn report(ctx: &AttemptContext, job: &Job, outcome: &JobOutcome) {
    ctx.counters.record(outcome);
    let attempts = outcome.attempts();
    match outcome {
        JobOutcome::Completed { .. } => {
            info!(job_id = %job.id, name = %job.name, attempts, "Job completed");
        }
        JobOutcome::Failed { error, .. } => {
            warn!(job_id = %job.id, name = %job.name, attempts, %error, "Job failed");
        }
        JobOutcome::SettleFailed { error, .. } => {
            error!(job_id = %job.id, name = %job.name, attempts, %error, "Job outcome not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobstore::{InMemoryStore, JobStatus, JobStatusDoc, StoreError, StoreResult};
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` calls, then succeeds
    struct FlakyExecutor {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobExecutor for FlakyExecutor {
        async fn execute(&self, _identity: &str, _payload: &[u8]) -> eyre::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(eyre::eyre!("flaky failure {}", n))
            } else {
                Ok(())
            }
        }
    }

    /// Sleeps past any reasonable timeout, recording whether it ever finished
    struct HangingExecutor {
        finished: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobExecutor for HangingExecutor {
        async fn execute(&self, _identity: &str, _payload: &[u8]) -> eyre::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Delegates to an in-memory store but refuses to settle
    struct BrokenSettleStore {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl JobStore for BrokenSettleStore {
        async fn add(&self, job: &Job) -> StoreResult<()> {
            self.inner.add(job).await
        }
        async fn claim_next(&self) -> StoreResult<Option<Job>> {
            self.inner.claim_next().await
        }
        async fn mark_completed(&self, _id: &str) -> StoreResult<()> {
            Err(StoreError::Database("disk full".to_string()))
        }
        async fn mark_failed(&self, _id: &str) -> StoreResult<()> {
            Err(StoreError::Database("disk full".to_string()))
        }
        async fn get_status(&self, id: &str) -> StoreResult<JobStatusDoc> {
            self.inner.get_status(id).await
        }
        async fn list(&self, status: Option<JobStatus>) -> StoreResult<Vec<JobStatusDoc>> {
            self.inner.list(status).await
        }
    }

    /// Delegates to an in-memory store and counts settlements
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryStore,
        completed: AtomicU32,
        failed: AtomicU32,
    }

    impl CountingStore {
        fn settlements(&self) -> u32 {
            self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobStore for CountingStore {
        async fn add(&self, job: &Job) -> StoreResult<()> {
            self.inner.add(job).await
        }
        async fn claim_next(&self) -> StoreResult<Option<Job>> {
            self.inner.claim_next().await
        }
        async fn mark_completed(&self, id: &str) -> StoreResult<()> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.inner.mark_completed(id).await
        }
        async fn mark_failed(&self, id: &str) -> StoreResult<()> {
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.inner.mark_failed(id).await
        }
        async fn get_status(&self, id: &str) -> StoreResult<JobStatusDoc> {
            self.inner.get_status(id).await
        }
        async fn list(&self, status: Option<JobStatus>) -> StoreResult<Vec<JobStatusDoc>> {
            self.inner.list(status).await
        }
    }

    fn policy(max_retries: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_millis(timeout_ms),
            retry_delay: Duration::from_millis(1),
            reclaim_exhausted: false,
        }
    }

    async fn claimed(store: &dyn JobStore, id: &str) -> Job {
        store.add(&Job::new(id, "work", 1.0)).await.unwrap();
        store.claim_next().await.unwrap().unwrap()
    }

    fn context(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        limit: usize,
        policy: RetryPolicy,
    ) -> AttemptContext {
        AttemptContext {
            store,
            executor,
            admission: Arc::new(AdmissionController::new(limit)),
            gate: Arc::new(PauseGate::new()),
            counters: Arc::new(PoolCounters::default()),
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let exec = Arc::new(FlakyExecutor {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let ctx = context(store.clone(), exec, 10, policy(3, 1000));
        let job = claimed(store.as_ref(), "ok").await;
        ctx.admission.acquire().await;

        let outcome = run_job(&ctx, &job).await;
        assert!(matches!(outcome, JobOutcome::Completed { attempts: 1 }));
        assert_eq!(store.get_status("ok").await.unwrap().status, JobStatus::Completed);

        let stats = ctx.admission.snapshot().await;
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.pending_hints, 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let exec = Arc::new(FlakyExecutor {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let ctx = context(store.clone(), exec.clone(), 10, policy(3, 1000));
        let job = claimed(store.as_ref(), "flaky").await;
        ctx.admission.acquire().await;

        let outcome = run_job(&ctx, &job).await;
        assert!(matches!(outcome, JobOutcome::Completed { attempts: 3 }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);

        // Three slots taken, one hint per finished attempt
        let stats = ctx.admission.snapshot().await;
        assert_eq!(stats.reserved, 3);
        assert_eq!(stats.pending_hints, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_one_unhinted_slot() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let exec = Arc::new(FlakyExecutor {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let ctx = context(store.clone(), exec.clone(), 10, policy(2, 1000));
        let job = claimed(store.as_ref(), "doomed").await;
        ctx.admission.acquire().await;

        let outcome = run_job(&ctx, &job).await;
        match outcome {
            JobOutcome::Failed {
                attempts,
                error: PoolError::RetriesExhausted { attempts: n, last },
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(n, 3);
                assert!(last.contains("flaky failure 2"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_status("doomed").await.unwrap().status, JobStatus::Failed);

        let stats = ctx.admission.snapshot().await;
        assert_eq!(stats.reserved, 3);
        assert_eq!(stats.pending_hints, 2);
    }

    #[tokio::test]
    async fn test_reclaim_exhausted_hints_every_attempt() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let exec = Arc::new(FlakyExecutor {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let mut p = policy(2, 1000);
        p.reclaim_exhausted = true;
        let ctx = context(store.clone(), exec, 10, p);
        let job = claimed(store.as_ref(), "doomed").await;
        ctx.admission.acquire().await;

        run_job(&ctx, &job).await;
        let stats = ctx.admission.snapshot().await;
        assert_eq!(stats.reserved, 3);
        assert_eq!(stats.pending_hints, 3);
    }

    #[tokio::test]
    async fn test_timeout_cancels_executor_and_retries() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let finished = Arc::new(AtomicU32::new(0));
        let exec = Arc::new(HangingExecutor {
            finished: finished.clone(),
        });
        let ctx = context(store.clone(), exec, 10, policy(1, 30));
        let job = claimed(store.as_ref(), "slow").await;
        ctx.admission.acquire().await;

        let outcome = run_job(&ctx, &job).await;
        match outcome {
            JobOutcome::Failed {
                attempts: 2,
                error: PoolError::RetriesExhausted { last, .. },
            } => assert!(last.contains("timed out")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.counters.snapshot().attempts, 2);
    }

    #[tokio::test]
    async fn test_settle_failure_is_reported_not_panicked() {
        let store: Arc<dyn JobStore> = Arc::new(BrokenSettleStore {
            inner: InMemoryStore::new(),
        });
        let exec = Arc::new(FlakyExecutor {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let ctx = Arc::new(context(store.clone(), exec, 10, policy(1, 1000)));
        let job = claimed(store.as_ref(), "stuck").await;
        ctx.admission.acquire().await;

        run_tracked(ctx.clone(), job).await;

        let counts = ctx.counters.snapshot();
        assert_eq!(counts.settle_failures, 1);
        assert_eq!(counts.completed, 0);
        // Still in progress from the store's point of view
        assert_eq!(store.get_status("stuck").await.unwrap().status, JobStatus::InProgress);
        assert_eq!(ctx.admission.snapshot().await.pending_hints, 0);
    }

    #[tokio::test]
    async fn test_retry_waits_for_slot() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let exec = Arc::new(FlakyExecutor {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let ctx = Arc::new(context(store.clone(), exec.clone(), 1, policy(3, 1000)));
        let job = claimed(store.as_ref(), "blocked").await;
        ctx.admission.acquire().await;

        let task = tokio::spawn(run_tracked(ctx.clone(), job));

        // The retry needs a second slot and the limit is one
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);

        ctx.admission.reconcile().await;
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(ctx.counters.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_pause_holds_attempts() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let exec = Arc::new(FlakyExecutor {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let ctx = Arc::new(context(store.clone(), exec.clone(), 10, policy(1, 1000)));
        let job = claimed(store.as_ref(), "held").await;
        ctx.admission.acquire().await;
        ctx.gate.pause();

        let task = tokio::spawn(run_tracked(ctx.clone(), job));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);

        ctx.gate.resume();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_retry_waiting_for_slot() {
        let store = Arc::new(CountingStore::default());
        let exec = Arc::new(FlakyExecutor {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let ctx = Arc::new(context(store.clone(), exec.clone(), 1, policy(3, 1000)));
        let job = claimed(store.as_ref(), "starved").await;
        ctx.admission.acquire().await;

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_job(&ctx, &job).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        ctx.shutdown.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                attempts: 1,
                error: PoolError::Interrupted { attempts: 1 }
            }
        ));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_status("starved").await.unwrap().status, JobStatus::Failed);
        assert_eq!(store.failed.load(Ordering::SeqCst), 1);
        assert_eq!(store.settlements(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_attempt_parked_on_pause() {
        let store = Arc::new(CountingStore::default());
        let exec = Arc::new(FlakyExecutor {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let ctx = Arc::new(context(store.clone(), exec.clone(), 10, policy(1, 1000)));
        let job = claimed(store.as_ref(), "parked").await;
        ctx.admission.acquire().await;
        ctx.gate.pause();

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_job(&ctx, &job).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        ctx.shutdown.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed {
                attempts: 0,
                error: PoolError::Interrupted { attempts: 0 }
            }
        ));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get_status("parked").await.unwrap().status, JobStatus::Failed);
        assert_eq!(store.settlements(), 1);

        // The unused slot is handed back
        let stats = ctx.admission.snapshot().await;
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.pending_hints, 1);
    }

    #[tokio::test]
    async fn test_free_slot_still_taken_after_shutdown() {
        let store = Arc::new(CountingStore::default());
        let exec = Arc::new(FlakyExecutor {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let ctx = context(store.clone(), exec.clone(), 10, policy(3, 1000));
        let job = claimed(store.as_ref(), "draining").await;
        ctx.admission.acquire().await;
        ctx.shutdown.cancel();

        let outcome = run_job(&ctx, &job).await;
        assert!(matches!(outcome, JobOutcome::Completed { attempts: 2 }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_each_job_settled_once() {
        let store = Arc::new(CountingStore::default());
        let exec = Arc::new(FlakyExecutor {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let ctx = context(store.clone(), exec, 10, policy(1, 1000));

        // Fails twice with one retry allowed
        let doomed = claimed(store.as_ref(), "doomed").await;
        ctx.admission.acquire().await;
        let outcome = run_job(&ctx, &doomed).await;
        assert!(matches!(outcome, JobOutcome::Failed { attempts: 2, .. }));
        assert_eq!(store.settlements(), 1);

        // Executor now succeeds
        let ok = claimed(store.as_ref(), "ok").await;
        ctx.admission.acquire().await;
        let outcome = run_job(&ctx, &ok).await;
        assert!(matches!(outcome, JobOutcome::Completed { attempts: 1 }));
        assert_eq!(store.settlements(), 2);

        assert_eq!(store.completed.load(Ordering::SeqCst), 1);
        assert_eq!(store.failed.load(Ordering::SeqCst), 1);
    }
}
