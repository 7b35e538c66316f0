//! jobstore - score-ordered job queue with status records
//!
//! A job is pushed as `pending`, claimed exactly once as `in_progress` (lowest
//! score first, ties in insertion order), and settled as `completed` or
//! `failed`. Status only moves forward.
//!
//! # Example
//!
//! ```ignore
//! use jobstore::{Job, JobStore, SqliteStore};
//!
//! let store = SqliteStore::open("jobs.db")?;
//! store.add(&Job::new("0190...", "resize", 1.0)).await?;
//! if let Some(job) = store.claim_next().await? {
//!     store.mark_completed(&job.id).await?;
//! }
//! ```

pub mod cli;
pub mod config;
mod error;
mod job;
mod memory;
mod sqlite;
mod store;

pub use error::{StoreError, StoreResult};
pub use job::{Job, JobStatus, JobStatusDoc};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use store::JobStore;
