//! Provider Alpha: submit-then-poll transcription client.
//!
//! Alpha takes the audio URL in a submit call, answers with a transcript
//! id, and expects fixed-interval polling until the transcript reaches a
//! terminal state. Timestamps come back in milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    mean_confidence, ProviderError, ProviderId, ProviderResult, TranscriptSegment,
    TranscriptionClient,
};
use crate::job::JobOptions;

#[derive(Debug, Clone)]
pub struct AlphaConfig {
    pub base_url: String,
    pub api_key: String,
    /// Fixed interval between status polls
    pub poll_interval: Duration,
    /// Maximum number of status polls before giving up
    pub max_polls: u32,
    /// Bounded retries for transient submit/poll errors
    pub max_retries: u32,
}

impl Default for AlphaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.alpha-speech.example.com".to_string(),
            api_key: String::new(),
            poll_interval: Duration::from_secs(3),
            max_polls: 600,
            max_retries: 3,
        }
    }
}

pub struct AlphaClient {
    http: reqwest::Client,
    config: AlphaConfig,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    audio_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language_code: Option<&'a str>,
    speaker_labels: bool,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct TranscriptResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    utterances: Vec<Utterance>,
}

#[derive(Deserialize)]
struct Utterance {
    /// Start time in milliseconds
    start: u64,
    /// End time in milliseconds
    end: u64,
    text: String,
    #[serde(default)]
    speaker: Option<String>,
    confidence: f64,
}

impl AlphaClient {
    pub fn new(config: AlphaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn submit(&self, audio_ref: &str, options: &JobOptions) -> Result<String, ProviderError> {
        let request = SubmitRequest {
            audio_url: audio_ref,
            language_code: options.language.as_deref(),
            speaker_labels: true,
        };

        let response = self
            .http
            .post(format!("{}/v2/transcripts", self.config.base_url))
            .header("authorization", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let submitted: SubmitResponse = response.json().await?;
        debug!("Alpha accepted transcript {}", submitted.id);
        Ok(submitted.id)
    }

    async fn fetch(&self, transcript_id: &str) -> Result<TranscriptResponse, ProviderError> {
        let response = self
            .http
            .get(format!(
                "{}/v2/transcripts/{}",
                self.config.base_url, transcript_id
            ))
            .header("authorization", &self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    /// Poll at a fixed interval until the transcript is terminal.
    async fn poll(&self, transcript_id: &str) -> Result<TranscriptResponse, ProviderError> {
        for _ in 0..self.config.max_polls {
            let transcript = self.retried(|| self.fetch(transcript_id)).await?;
            match transcript.status.as_str() {
                "completed" => return Ok(transcript),
                "error" => {
                    return Err(ProviderError::Rejected(
                        transcript
                            .error
                            .unwrap_or_else(|| "unspecified provider error".to_string()),
                    ))
                }
                "queued" | "processing" => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                other => {
                    return Err(ProviderError::Parse(format!(
                        "unknown transcript status {other:?}"
                    )))
                }
            }
        }
        Err(ProviderError::PollBudgetExhausted(self.config.max_polls))
    }

    /// Retry a call on transient errors, up to the configured bound.
    async fn retried<F, Fut, T>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!("Alpha transient error (attempt {}): {}", attempt, e);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run(
        &self,
        audio_ref: &str,
        options: &JobOptions,
    ) -> Result<(Vec<TranscriptSegment>, f64), ProviderError> {
        let transcript_id = self.retried(|| self.submit(audio_ref, options)).await?;
        let transcript = self.poll(&transcript_id).await?;

        let segments: Vec<TranscriptSegment> = transcript
            .utterances
            .into_iter()
            .map(|u| TranscriptSegment {
                start_secs: u.start as f64 / 1000.0,
                end_secs: u.end as f64 / 1000.0,
                text: u.text,
                speaker: u.speaker,
                confidence: u.confidence,
            })
            .collect();

        let overall = transcript
            .confidence
            .unwrap_or_else(|| mean_confidence(&segments));

        info!(
            "Alpha transcribed {} into {} segments (confidence {:.2})",
            audio_ref,
            segments.len(),
            overall
        );
        Ok((segments, overall))
    }
}

#[async_trait::async_trait]
impl TranscriptionClient for AlphaClient {
    fn id(&self) -> ProviderId {
        ProviderId::Alpha
    }

    async fn transcribe(&self, audio_ref: &str, options: &JobOptions) -> ProviderResult {
        match self.run(audio_ref, options).await {
            Ok((segments, overall)) => ProviderResult::success(ProviderId::Alpha, segments, overall),
            Err(e) => {
                warn!("Alpha failed for {}: {}", audio_ref, e);
                ProviderResult::failed(ProviderId::Alpha, e.to_string())
            }
        }
    }
}
