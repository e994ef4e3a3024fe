//! Durable job queue
//!
//! At-least-once delivery over the `lsif_jobs` table in the shared
//! database: claiming a job bumps its attempt counter and takes a lease;
//! a worker that dies mid-job loses the lease and the job is claimable
//! again. Failed attempts requeue with exponential backoff until
//! `max_attempts`, then park as `failed` for operator inspection.
//! Non-retryable failures (invalid payloads) park immediately.

pub mod worker;

use crate::db::{now_millis, row_i64, row_opt_text, row_text};
use crate::error::{Error, Result};
use crate::xrepo::CrossRepoIndex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use turso::{Connection, Value};

const BACKOFF_BASE: Duration = Duration::from_secs(10);
const BACKOFF_CAP: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Convert,
    UpdateTips,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Convert => "convert",
            JobKind::UpdateTips => "update-tips",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "convert" => Ok(JobKind::Convert),
            "update-tips" => Ok(JobKind::UpdateTips),
            other => Err(Error::Fatal(format!("unknown job kind {other:?}"))),
        }
    }
}

/// Payload of a `convert` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertPayload {
    pub repository: String,
    pub commit: String,
    pub root: String,
    pub upload_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct JobQueue {
    index: Arc<CrossRepoIndex>,
    max_attempts: u32,
    lease: Duration,
    backoff_base: Duration,
}

impl JobQueue {
    pub fn new(index: Arc<CrossRepoIndex>, max_attempts: u32, lease: Duration) -> Self {
        Self {
            index,
            max_attempts,
            lease,
            backoff_base: BACKOFF_BASE,
        }
    }

    /// Shrink the retry backoff; integration tests use this to exercise
    /// redelivery without waiting out the production schedule.
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Enqueue a job, returning its id.
    pub async fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> Result<i64> {
        let conn = self.index.write_lock().lock().await;
        let id = self.insert_job(&conn, kind, payload).await?;
        debug!(job_id = id, kind = kind.as_str(), "enqueued job");
        Ok(id)
    }

    /// Enqueue unless a job of this kind is already queued or active.
    /// Returns `None` when the singleton already exists.
    pub async fn enqueue_singleton(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<Option<i64>> {
        let conn = self.index.write_lock().lock().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM lsif_jobs
                 WHERE kind = ? AND status IN ('queued', 'active') LIMIT 1",
                [Value::Text(kind.as_str().to_string())],
            )
            .await?;
        if rows.next().await?.is_some() {
            return Ok(None);
        }
        let id = self.insert_job(&conn, kind, payload).await?;
        debug!(job_id = id, kind = kind.as_str(), "enqueued singleton job");
        Ok(Some(id))
    }

    async fn insert_job(
        &self,
        conn: &Connection,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let now = now_millis();
        conn.execute(
            "INSERT INTO lsif_jobs
             (kind, payload, status, attempts, max_attempts, run_after, created_at, updated_at)
             VALUES (?, ?, 'queued', 0, ?, ?, ?, ?)",
            [
                Value::Text(kind.as_str().to_string()),
                Value::Text(payload.to_string()),
                Value::Integer(self.max_attempts as i64),
                Value::Integer(now),
                Value::Integer(now),
                Value::Integer(now),
            ],
        )
        .await?;
        // The write lock is held, so no insert can interleave.
        let mut rows = conn.query("SELECT MAX(id) FROM lsif_jobs", ()).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| Error::Fatal("job id query returned nothing".to_string()))?;
        row_i64(&row, 0)
    }

    /// Claim the oldest runnable job: queued with its backoff elapsed, or
    /// active with an expired lease (a prior worker died holding it).
    pub async fn claim(&self) -> Result<Option<Job>> {
        let conn = self.index.write_lock().lock().await;
        let now = now_millis();
        conn.execute("BEGIN TRANSACTION", ()).await?;
        let claimed = async {
            let mut rows = conn
                .query(
                    "SELECT id, kind, payload, attempts, max_attempts FROM lsif_jobs
                     WHERE (status = 'queued' AND run_after <= ?)
                        OR (status = 'active' AND lease_expires_at <= ?)
                     ORDER BY id LIMIT 1",
                    [Value::Integer(now), Value::Integer(now)],
                )
                .await?;
            let Some(row) = rows.next().await? else {
                return Ok(None);
            };
            let job = Job {
                id: row_i64(&row, 0)?,
                kind: JobKind::from_str(&row_text(&row, 1)?)?,
                payload: serde_json::from_str(&row_text(&row, 2)?)
                    .map_err(|err| Error::Fatal(format!("corrupt job payload: {err}")))?,
                attempts: row_i64(&row, 3)? as u32 + 1,
                max_attempts: row_i64(&row, 4)? as u32,
            };
            conn.execute(
                "UPDATE lsif_jobs
                 SET status = 'active', attempts = ?, lease_expires_at = ?, updated_at = ?
                 WHERE id = ?",
                [
                    Value::Integer(job.attempts as i64),
                    Value::Integer(now + self.lease.as_millis() as i64),
                    Value::Integer(now),
                    Value::Integer(job.id),
                ],
            )
            .await?;
            Ok(Some(job))
        }
        .await;
        match claimed {
            Ok(job) => {
                conn.execute("COMMIT", ()).await?;
                Ok(job)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }

    pub async fn complete(&self, job: &Job) -> Result<()> {
        let conn = self.index.write_lock().lock().await;
        conn.execute(
            "UPDATE lsif_jobs SET status = 'completed', lease_expires_at = NULL, updated_at = ?
             WHERE id = ?",
            [Value::Integer(now_millis()), Value::Integer(job.id)],
        )
        .await?;
        info!(job_id = job.id, kind = job.kind.as_str(), "job completed");
        Ok(())
    }

    /// Record a failed attempt. Retryable failures requeue with backoff
    /// until attempts are exhausted.
    pub async fn fail(&self, job: &Job, message: &str, retryable: bool) -> Result<()> {
        let conn = self.index.write_lock().lock().await;
        let now = now_millis();
        if retryable && job.attempts < job.max_attempts {
            let backoff = backoff_for_attempt(self.backoff_base, job.attempts);
            conn.execute(
                "UPDATE lsif_jobs
                 SET status = 'queued', last_error = ?, run_after = ?,
                     lease_expires_at = NULL, updated_at = ?
                 WHERE id = ?",
                [
                    Value::Text(message.to_string()),
                    Value::Integer(now + backoff.as_millis() as i64),
                    Value::Integer(now),
                    Value::Integer(job.id),
                ],
            )
            .await?;
            warn!(
                job_id = job.id,
                kind = job.kind.as_str(),
                attempt = job.attempts,
                backoff_secs = backoff.as_secs(),
                error = message,
                "job failed, will retry"
            );
        } else {
            conn.execute(
                "UPDATE lsif_jobs
                 SET status = 'failed', last_error = ?, lease_expires_at = NULL, updated_at = ?
                 WHERE id = ?",
                [
                    Value::Text(message.to_string()),
                    Value::Integer(now),
                    Value::Integer(job.id),
                ],
            )
            .await?;
            warn!(
                job_id = job.id,
                kind = job.kind.as_str(),
                attempt = job.attempts,
                error = message,
                "job failed terminally"
            );
        }
        Ok(())
    }

    /// Sampled queue statistics for metrics and operators.
    pub async fn counts(&self) -> Result<QueueCounts> {
        let conn = self.index.read_connection()?;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM lsif_jobs GROUP BY status",
                (),
            )
            .await?;
        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next().await? {
            let status = row_text(&row, 0)?;
            let count = row_i64(&row, 1)? as u64;
            match status.as_str() {
                "queued" => counts.queued = count,
                "active" => counts.active = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Last recorded error for a job, for tests and operator tooling.
    pub async fn last_error(&self, job_id: i64) -> Result<Option<String>> {
        let conn = self.index.read_connection()?;
        let mut rows = conn
            .query(
                "SELECT last_error FROM lsif_jobs WHERE id = ?",
                [Value::Integer(job_id)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_opt_text(&row, 0),
            None => Ok(None),
        }
    }
}

fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(BACKOFF_CAP)
}

/// Payload helper for `convert` jobs.
pub fn convert_payload(payload: &ConvertPayload) -> serde_json::Value {
    json!(payload)
}
