//! Result sink: hands reconciled transcripts to persistence and
//! notification collaborators.
//!
//! The worker only sees the trait; the production implementation writes
//! to the transcripts table that the status API reads. Webhook delivery
//! hangs off the same seam but its mechanics live elsewhere.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::db::DbPool;
use crate::reconcile::ReconciledTranscript;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("failed to encode transcript: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Owns the `ReconciledTranscript` once a job completes.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist the transcript and return an opaque result reference.
    async fn persist(&self, transcript: &ReconciledTranscript) -> Result<String, SinkError>;
}

/// Stores transcripts in SQLite next to the job queue.
pub struct SqliteSink {
    pool: DbPool,
}

impl SqliteSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Fetch a persisted transcript by job id (the status API's read
    /// path).
    pub async fn load(&self, job_id: &str) -> Result<Option<ReconciledTranscript>, SinkError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT transcript FROM transcripts WHERE job_id = ?1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    async fn persist(&self, transcript: &ReconciledTranscript) -> Result<String, SinkError> {
        let id = Uuid::new_v4().to_string();
        let json = serde_json::to_string(transcript)?;

        // Re-running a job replaces its previous result; jobs produce at
        // most one live transcript.
        sqlx::query(
            r#"
            INSERT INTO transcripts (id, job_id, transcript, agreement_rate,
                                     mean_confidence, needs_review, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(job_id) DO UPDATE SET
                id = excluded.id,
                transcript = excluded.transcript,
                agreement_rate = excluded.agreement_rate,
                mean_confidence = excluded.mean_confidence,
                needs_review = excluded.needs_review,
                created_at = excluded.created_at
            "#,
        )
        .bind(&id)
        .bind(&transcript.job_id)
        .bind(&json)
        .bind(transcript.quality.provider_agreement_rate)
        .bind(transcript.quality.mean_confidence)
        .bind(transcript.quality.segments_needing_review as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        // Notification hook: downstream webhook dispatch keys off this
        // event.
        info!(
            "Transcript ready for job {} ({} segments, {} needing review)",
            transcript.job_id,
            transcript.final_segments.len(),
            transcript.quality.segments_needing_review
        );
        Ok(id)
    }
}
