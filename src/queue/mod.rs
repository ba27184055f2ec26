//! Durable job queue backed by SQLite.
//!
//! Every lifecycle transition is a single SQL statement, so contention
//! between workers is resolved by the database's write serialization
//! rather than any application-level lock. The claim statement in
//! particular selects and stamps a job in one atomic step; two workers can
//! never be handed the same row.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::DbPool;
use crate::job::{Job, JobPayload, JobStatus};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("failed to encode job payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_id} is no longer held by {worker_id}")]
    StaleClaim { job_id: String, worker_id: String },
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Counts from a lease sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Jobs whose lapsed lease was released back to `pending`.
    pub requeued: u64,
    /// Jobs that lapsed with no attempts left and went `dead`.
    pub dead: u64,
}

/// Per-status job counts, for the status API.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

/// Handle to the shared job store.
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct QueueStore {
    pool: DbPool,
    default_max_attempts: i64,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    status: String,
    audio_ref: String,
    options: String,
    priority: i64,
    attempt_count: i64,
    max_attempts: i64,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    result_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            status: JobStatus::parse(&self.status).unwrap_or(JobStatus::Pending),
            payload: JobPayload {
                audio_ref: self.audio_ref,
                options: serde_json::from_str(&self.options).unwrap_or_default(),
            },
            id: self.id,
            priority: self.priority,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            last_error: self.last_error,
            result_ref: self.result_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl QueueStore {
    pub fn new(pool: DbPool, default_max_attempts: i64) -> Self {
        Self {
            pool,
            default_max_attempts,
        }
    }

    /// Insert a new `pending` job and return its id.
    pub async fn enqueue(&self, payload: &JobPayload, priority: i64) -> Result<String, QueueError> {
        let id = Job::new_id();
        let options = serde_json::to_string(&payload.options)?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, audio_ref, options, priority,
                              attempt_count, max_attempts, created_at, updated_at)
            VALUES (?1, 'pending', ?2, ?3, ?4, 0, ?5, ?6, ?6)
            "#,
        )
        .bind(&id)
        .bind(&payload.audio_ref)
        .bind(&options)
        .bind(priority)
        .bind(self.default_max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("Enqueued job {} (priority {})", id, priority);
        Ok(id)
    }

    /// Atomically claim the best available job for `worker_id`.
    ///
    /// Eligible rows are `pending`/`failed` jobs and `claimed`/`processing`
    /// jobs whose lease lapsed, always with attempts remaining. The select
    /// and the stamp happen in one statement, which is what makes claims
    /// race-free.
    pub async fn claim(
        &self,
        worker_id: &str,
        lease_secs: i64,
    ) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(lease_secs);

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                status = 'claimed',
                claimed_by = ?1,
                claimed_at = ?2,
                attempt_count = attempt_count + 1,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE (status IN ('pending', 'failed')
                       OR (status IN ('claimed', 'processing') AND claimed_at <= ?3))
                  AND attempt_count < max_attempts
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        let job = row.map(JobRow::into_job);
        if let Some(job) = &job {
            debug!(
                "Worker {} claimed job {} (attempt {}/{})",
                worker_id, job.id, job.attempt_count, job.max_attempts
            );
        }
        Ok(job)
    }

    /// Move a freshly claimed job to `processing`.
    pub async fn mark_processing(&self, job_id: &str, worker_id: &str) -> Result<(), QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs SET status = 'processing', updated_at = ?3
            WHERE id = ?1 AND claimed_by = ?2 AND status = 'claimed'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(QueueError::StaleClaim {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Complete a job the worker still holds.
    ///
    /// The `claimed_by` guard means a worker whose lease expired (and whose
    /// job was reclaimed by someone else) cannot record a second
    /// completion.
    pub async fn mark_completed(
        &self,
        job_id: &str,
        worker_id: &str,
        result_ref: &str,
    ) -> Result<(), QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs SET status = 'completed', result_ref = ?3, updated_at = ?4
            WHERE id = ?1 AND claimed_by = ?2 AND status IN ('claimed', 'processing')
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(result_ref)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(QueueError::StaleClaim {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        info!("Job {} completed", job_id);
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// The job goes back to `failed` (claimable again) while attempts
    /// remain, or `dead` once `max_attempts` is reached. Returns the
    /// resulting status.
    pub async fn mark_failed(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<JobStatus, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                status = CASE WHEN attempt_count >= max_attempts THEN 'dead' ELSE 'failed' END,
                last_error = ?3,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = ?4
            WHERE id = ?1 AND claimed_by = ?2 AND status IN ('claimed', 'processing')
            RETURNING status
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(QueueError::StaleClaim {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        };

        let status: String = row.try_get("status")?;
        let status = JobStatus::parse(&status).unwrap_or(JobStatus::Failed);
        info!("Job {} failed ({}): {}", job_id, status, error);
        Ok(status)
    }

    /// Crash-recovery sweep: release jobs whose lease lapsed without a
    /// completion.
    ///
    /// Jobs with attempts remaining go back to `pending`; exhausted ones go
    /// `dead`. The claim statement can also pick up lapsed leases directly,
    /// so this sweep mostly matters for moving exhausted jobs out of limbo
    /// and keeping queue stats honest.
    pub async fn release_expired_leases(&self, lease_secs: i64) -> Result<SweepOutcome, QueueError> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(lease_secs);

        let dead = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'dead',
                last_error = COALESCE(last_error, 'lease expired with no attempts remaining'),
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = ?1
            WHERE status IN ('claimed', 'processing')
              AND claimed_at <= ?2
              AND attempt_count >= max_attempts
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = ?1
            WHERE status IN ('claimed', 'processing')
              AND claimed_at <= ?2
              AND attempt_count < max_attempts
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if requeued > 0 || dead > 0 {
            info!(
                "Lease sweep: requeued {} job(s), {} went dead",
                requeued, dead
            );
        }
        Ok(SweepOutcome { requeued, dead })
    }

    /// Fetch a job by id.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(JobRow::into_job))
    }

    /// Cancel a job that is not running and not terminal.
    pub async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let job = self
            .get(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if !matches!(job.status, JobStatus::Pending | JobStatus::Failed) {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Dead,
            });
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'dead', last_error = 'cancelled', updated_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        info!("Job {} cancelled", job_id);
        Ok(())
    }

    /// Per-status counts.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let n = n as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = n,
                Some(JobStatus::Claimed) => stats.claimed = n,
                Some(JobStatus::Processing) => stats.processing = n,
                Some(JobStatus::Completed) => stats.completed = n,
                Some(JobStatus::Failed) => stats.failed = n,
                Some(JobStatus::Dead) => stats.dead = n,
                None => {}
            }
        }
        Ok(stats)
    }
}
