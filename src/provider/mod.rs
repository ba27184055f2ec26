//! Transcription provider abstraction.
//!
//! Two independent speech-to-text backends sit behind one trait. Each
//! concrete client owns its own submit/poll/parse cycle and error
//! taxonomy, but everything that comes out of this module is a
//! `ProviderResult`: a failed or timed-out call yields
//! `ProviderStatus::Failed`, never an error the worker has to handle.

mod alpha;
mod beta;

pub use alpha::{AlphaClient, AlphaConfig};
pub use beta::{BetaClient, BetaConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobOptions;

/// The closed set of transcription backends.
///
/// New providers are added as variants here, not through a runtime
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Alpha,
    Beta,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Alpha => "alpha",
            ProviderId::Beta => "beta",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A segment of transcribed speech as returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds
    pub start_secs: f64,
    /// End time in seconds
    pub end_secs: f64,
    /// Transcribed text
    pub text: String,
    /// Speaker label, if the provider diarized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
}

impl TranscriptSegment {
    pub fn duration_secs(&self) -> f64 {
        (self.end_secs - self.start_secs).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderStatus {
    Success,
    Failed { reason: String },
}

/// Outcome of one provider call for one job. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    pub provider: ProviderId,
    pub segments: Vec<TranscriptSegment>,
    pub overall_confidence: f64,
    pub status: ProviderStatus,
}

impl ProviderResult {
    pub fn success(
        provider: ProviderId,
        segments: Vec<TranscriptSegment>,
        overall_confidence: f64,
    ) -> Self {
        Self {
            provider,
            segments,
            overall_confidence,
            status: ProviderStatus::Success,
        }
    }

    pub fn failed(provider: ProviderId, reason: impl Into<String>) -> Self {
        Self {
            provider,
            segments: Vec::new(),
            overall_confidence: 0.0,
            status: ProviderStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ProviderStatus::Success)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            ProviderStatus::Failed { reason } => Some(reason),
            ProviderStatus::Success => None,
        }
    }
}

/// Errors internal to a provider client.
///
/// Transient errors are retried inside the client up to its own bound;
/// everything ultimately maps into a `ProviderResult`.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("provider rejected the audio: {0}")]
    Rejected(String),
    #[error("transcript not ready after {0} poll attempts")]
    PollBudgetExhausted(u32),
    #[error("unexpected response shape: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Rejected(_) | ProviderError::Parse(_) => false,
            ProviderError::PollBudgetExhausted(_) => true,
        }
    }
}

/// One transcription backend.
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Transcribe `audio_ref` and map every outcome, success or failure,
    /// into a `ProviderResult`.
    async fn transcribe(&self, audio_ref: &str, options: &JobOptions) -> ProviderResult;
}

/// Mean segment confidence, used when a provider gives no aggregate score.
pub(crate) fn mean_confidence(segments: &[TranscriptSegment]) -> f64 {
    if segments.is_empty() {
        return 0.0;
    }
    segments.iter().map(|s| s.confidence).sum::<f64>() / segments.len() as f64
}
