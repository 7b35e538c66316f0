//! The JobStore capability

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::job::{Job, JobStatus, JobStatusDoc};

/// Priority queue of jobs plus their status records
///
/// Implementations must make `claim_next` atomic: a job is handed to exactly
/// one caller, and it is the pending job with the lowest score (ties go to the
/// earliest insertion).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job
    async fn add(&self, job: &Job) -> StoreResult<()>;

    /// Pop the lowest-score pending job and mark it in progress
    ///
    /// Returns `Ok(None)` when no pending job exists.
    async fn claim_next(&self) -> StoreResult<Option<Job>>;

    /// Settle an in-progress job as completed
    async fn mark_completed(&self, id: &str) -> StoreResult<()>;

    /// Settle an in-progress job as failed
    async fn mark_failed(&self, id: &str) -> StoreResult<()>;

    /// Fetch the status document for a job
    async fn get_status(&self, id: &str) -> StoreResult<JobStatusDoc>;

    /// List jobs, optionally filtered by status, in insertion order
    async fn list(&self, status: Option<JobStatus>) -> StoreResult<Vec<JobStatusDoc>>;
}
