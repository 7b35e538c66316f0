//! SQLite-backed job store
//!
//! One table holds every job. An autoincrement `seq` column records insertion
//! order so equal scores are claimed first-in first-out. Claims run inside an
//! immediate transaction, which makes them atomic across connections too.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::job::{Job, JobStatus, JobStatusDoc};
use crate::store::JobStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    score       REAL NOT NULL,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    started_at  TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, score, seq);
"#;

const SELECT_COLUMNS: &str = "id, name, score, status, created_at, started_at, finished_at";

/// Raw column values, converted to a `Job` outside the rusqlite row callback
struct JobRow {
    id: String,
    name: String,
    score: f64,
    status: String,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            score: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }

    fn into_job(self) -> StoreResult<Job> {
        let status = self.status.parse::<JobStatus>().map_err(StoreError::Serialization)?;
        Ok(Job {
            id: self.id,
            name: self.name,
            score: self.score,
            status,
            created_at: parse_timestamp(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{}': {}", s, e)))
}

fn fetch_job(conn: &Connection, id: &str) -> StoreResult<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, params![id], JobRow::from_row)
        .optional()?
        .map(JobRow::into_job)
        .transpose()
}

fn settle(conn: &mut Connection, id: &str, to: JobStatus) -> StoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current: Option<String> = tx
        .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    let current = current.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    let from = current.parse::<JobStatus>().map_err(StoreError::Serialization)?;

    if !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        });
    }

    tx.execute(
        "UPDATE jobs SET status = ?1, finished_at = ?2 WHERE id = ?3",
        params![to.as_str(), Utc::now().to_rfc3339(), id],
    )?;
    tx.commit()?;
    Ok(())
}

/// Job store persisted in a SQLite database file
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(?path, "SqliteStore::open: called");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        info!(?path, "Opened job store");
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file path, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a blocking closure against the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Database(format!("connection lock poisoned: {}", e)))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Io(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn add(&self, job: &Job) -> StoreResult<()> {
        debug!(job_id = %job.id, name = %job.name, score = job.score, "SqliteStore::add: called");
        let job = job.clone();
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT seq FROM jobs WHERE id = ?1", params![job.id], |row| row.get(0))
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::Duplicate(job.id));
            }

            conn.execute(
                "INSERT INTO jobs (id, name, score, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    job.id,
                    job.name,
                    job.score,
                    JobStatus::Pending.as_str(),
                    job.created_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn claim_next(&self) -> StoreResult<Option<Job>> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let id: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs WHERE status = ?1 ORDER BY score ASC, seq ASC LIMIT 1",
                    params![JobStatus::Pending.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = id else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE jobs SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![JobStatus::InProgress.as_str(), Utc::now().to_rfc3339(), id],
            )?;
            let job = fetch_job(&tx, &id)?;
            tx.commit()?;

            if let Some(job) = &job {
                debug!(job_id = %job.id, score = job.score, "SqliteStore::claim_next: claimed");
            }
            Ok(job)
        })
        .await
    }

    async fn mark_completed(&self, id: &str) -> StoreResult<()> {
        debug!(job_id = %id, "SqliteStore::mark_completed: called");
        let id = id.to_string();
        self.with_conn(move |conn| settle(conn, &id, JobStatus::Completed)).await
    }

    async fn mark_failed(&self, id: &str) -> StoreResult<()> {
        debug!(job_id = %id, "SqliteStore::mark_failed: called");
        let id = id.to_string();
        self.with_conn(move |conn| settle(conn, &id, JobStatus::Failed)).await
    }

    async fn get_status(&self, id: &str) -> StoreResult<JobStatusDoc> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            fetch_job(conn, &id)?
                .map(|job| job.status_doc())
                .ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn list(&self, status: Option<JobStatus>) -> StoreResult<Vec<JobStatusDoc>> {
        self.with_conn(move |conn| {
            let rows: Vec<JobRow> = match status {
                Some(status) => {
                    let sql = format!("SELECT {} FROM jobs WHERE status = ?1 ORDER BY seq", SELECT_COLUMNS);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![status.as_str()], JobRow::from_row)?
                        .collect::<rusqlite::Result<_>>()?;
                    rows
                }
                None => {
                    let sql = format!("SELECT {} FROM jobs ORDER BY seq", SELECT_COLUMNS);
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map([], JobRow::from_row)?.collect::<rusqlite::Result<_>>()?;
                    rows
                }
            };

            rows.into_iter()
                .map(|row| row.into_job().map(|job| job.status_doc()))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_add_claim_complete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(&Job::new("a", "alpha", 1.0)).await.unwrap();

        let job = store.claim_next().await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.name, "alpha");
        assert_eq!(job.score, 1.0);
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.started_at.is_some());

        store.mark_completed("a").await.unwrap();
        let doc = store.get_status("a").await.unwrap();
        assert_eq!(doc.status, JobStatus::Completed);
        assert!(doc.finished_at.is_some());
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_score_then_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(&Job::new("tie-1", "t", 2.0)).await.unwrap();
        store.add(&Job::new("low", "l", 0.5)).await.unwrap();
        store.add(&Job::new("tie-2", "t", 2.0)).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = store.claim_next().await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec!["low", "tie-1", "tie-2"]);
    }

    #[tokio::test]
    async fn test_transitions_enforced() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(&Job::new("a", "alpha", 1.0)).await.unwrap();

        let err = store.mark_failed("a").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Failed,
                ..
            }
        ));

        store.claim_next().await.unwrap();
        store.mark_failed("a").await.unwrap();
        assert!(store.mark_completed("a").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_and_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add(&Job::new("a", "alpha", 1.0)).await.unwrap();
        assert!(matches!(
            store.add(&Job::new("a", "beta", 1.0)).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(matches!(store.get_status("zzz").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.mark_completed("zzz").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("jobs.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.add(&Job::new("keep", "k", 1.0)).await.unwrap();
            store.add(&Job::new("done", "d", 0.0)).await.unwrap();
            store.claim_next().await.unwrap();
            store.mark_completed("done").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(store.get_status("done").await.unwrap().status, JobStatus::Completed);

        let pending = store.list(Some(JobStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "keep");
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..50 {
            store.add(&Job::new(format!("j{i}"), "n", (i % 5) as f64)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = store.claim_next().await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50);
    }
}
