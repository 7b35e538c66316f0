//! In-memory job store

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::job::{Job, JobStatus, JobStatusDoc};
use crate::store::JobStore;

/// Heap entry ordered so the lowest (score, seq) pops first
#[derive(Debug)]
struct QueueEntry {
    score: f64,
    seq: u64,
    id: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    queue: BinaryHeap<QueueEntry>,
    records: HashMap<String, (u64, Job)>,
    next_seq: u64,
}

impl StoreInner {
    fn settle(&mut self, id: &str, to: JobStatus) -> StoreResult<()> {
        let (_, job) = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !job.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to,
            });
        }

        job.status = to;
        job.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// Job store held entirely in process memory
///
/// Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending jobs waiting to be claimed
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn add(&self, job: &Job) -> StoreResult<()> {
        debug!(job_id = %job.id, name = %job.name, score = job.score, "InMemoryStore::add: called");
        let mut inner = self.inner.lock().await;

        if inner.records.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id.clone()));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut record = job.clone();
        record.status = JobStatus::Pending;
        record.started_at = None;
        record.finished_at = None;

        inner.queue.push(QueueEntry {
            score: record.score,
            seq,
            id: record.id.clone(),
        });
        inner.records.insert(record.id.clone(), (seq, record));
        Ok(())
    }

    async fn claim_next(&self) -> StoreResult<Option<Job>> {
        let mut inner = self.inner.lock().await;

        while let Some(entry) = inner.queue.pop() {
            let Some((_, job)) = inner.records.get_mut(&entry.id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            job.status = JobStatus::InProgress;
            job.started_at = Some(Utc::now());
            debug!(job_id = %job.id, score = job.score, "InMemoryStore::claim_next: claimed");
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn mark_completed(&self, id: &str) -> StoreResult<()> {
        debug!(job_id = %id, "InMemoryStore::mark_completed: called");
        self.inner.lock().await.settle(id, JobStatus::Completed)
    }

    async fn mark_failed(&self, id: &str) -> StoreResult<()> {
        debug!(job_id = %id, "InMemoryStore::mark_failed: called");
        self.inner.lock().await.settle(id, JobStatus::Failed)
    }

    async fn get_status(&self, id: &str) -> StoreResult<JobStatusDoc> {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(id)
            .map(|(_, job)| job.status_doc())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, status: Option<JobStatus>) -> StoreResult<Vec<JobStatusDoc>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<&(u64, Job)> = inner
            .records
            .values()
            .filter(|(_, job)| status.is_none_or(|s| job.status == s))
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, job)| job.status_doc()).collect())
    }
}
