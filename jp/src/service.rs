//! Job submission and lookup

use std::sync::Arc;

use jobstore::{Job, JobStatusDoc, JobStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Job name must not be empty")]
    EmptyName,

    #[error("Score must be a finite number, got {0}")]
    InvalidScore(f64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates submissions and talks to the store on behalf of the control surface
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Insert a pending job and return its id
    pub async fn submit(&self, name: &str, score: f64) -> Result<String, ServiceError> {
        debug!(%name, score, "JobService::submit: called");
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::EmptyName);
        }
        if !score.is_finite() {
            return Err(ServiceError::InvalidScore(score));
        }

        let id = Uuid::now_v7().to_string();
        self.store.add(&Job::new(&id, name, score)).await?;
        info!(job_id = %id, %name, score, "Job submitted");
        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Result<JobStatusDoc, ServiceError> {
        debug!(%id, "JobService::status: called");
        Ok(self.store.get_status(id).await?)
    }
}
