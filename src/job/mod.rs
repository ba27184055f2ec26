//! Job records and their state machine.
//!
//! A job is the unit of work: one audio reference to be transcribed by both
//! providers and reconciled. All lifecycle mutation goes through the queue
//! store; this module only defines the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states for a transcription job.
///
/// `Failed` jobs still have attempts left and are claimable again;
/// `Dead` jobs exhausted `max_attempts` and are never reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "claimed" => Some(JobStatus::Claimed),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "dead" => Some(JobStatus::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing options carried in the job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Language hint passed through to providers (None = auto-detect)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Whether to call provider Alpha for this job
    #[serde(default = "default_enabled")]
    pub alpha_enabled: bool,
    /// Whether to call provider Beta for this job
    #[serde(default = "default_enabled")]
    pub beta_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            language: None,
            alpha_enabled: true,
            beta_enabled: true,
        }
    }
}

/// What a job operates on: an opaque audio reference plus options.
///
/// The `audio_ref` is a URI resolved by the provider clients, never opened
/// by the core itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub audio_ref: String,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobPayload {
    pub fn new(audio_ref: impl Into<String>) -> Self {
        Self {
            audio_ref: audio_ref.into(),
            options: JobOptions::default(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.options.language = Some(language.into());
        self
    }
}

/// A transcription job as stored in the queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    /// Higher priority is served first; ties broken by enqueue time.
    pub priority: i64,
    /// Incremented on every claim, never decremented.
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn attempts_remaining(&self) -> i64 {
        (self.max_attempts - self.attempt_count).max(0)
    }
}
