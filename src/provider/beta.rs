//! Provider Beta: reference-based transcription client.
//!
//! Beta creates a job from the audio URL and reports progress through a
//! job resource. Polling backs off exponentially up to a cap, since Beta
//! rate-limits aggressive pollers. Timestamps come back in seconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    mean_confidence, ProviderError, ProviderId, ProviderResult, TranscriptSegment,
    TranscriptionClient,
};
use crate::job::JobOptions;

#[derive(Debug, Clone)]
pub struct BetaConfig {
    pub base_url: String,
    pub api_key: String,
    /// Initial poll delay; doubles up to `max_poll_interval`
    pub initial_poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Maximum number of status polls before giving up
    pub max_polls: u32,
    /// Bounded retries for transient submit/poll errors
    pub max_retries: u32,
}

impl Default for BetaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.beta-listen.example.com".to_string(),
            api_key: String::new(),
            initial_poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(30),
            max_polls: 200,
            max_retries: 3,
        }
    }
}

pub struct BetaClient {
    http: reqwest::Client,
    config: BetaConfig,
}

#[derive(Serialize)]
struct CreateJobRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    diarize: bool,
}

#[derive(Deserialize)]
struct CreateJobResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct JobResponse {
    state: String,
    #[serde(default)]
    failure: Option<String>,
    #[serde(default)]
    result: Option<BetaResult>,
}

#[derive(Deserialize)]
struct BetaResult {
    segments: Vec<BetaSegment>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Deserialize)]
struct BetaSegment {
    /// Start time in seconds
    start: f64,
    /// End time in seconds
    end: f64,
    transcript: String,
    #[serde(default)]
    speaker: Option<u32>,
    confidence: f64,
}

impl BetaClient {
    pub fn new(config: BetaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn submit(&self, audio_ref: &str, options: &JobOptions) -> Result<String, ProviderError> {
        let request = CreateJobRequest {
            url: audio_ref,
            language: options.language.as_deref(),
            diarize: true,
        };

        let response = self
            .http
            .post(format!("{}/v1/listen/jobs", self.config.base_url))
            .bearer_auth(&self.config.api_key)
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

        let created: CreateJobResponse = response.json().await?;
        debug!("Beta accepted job {}", created.job_id);
        Ok(created.job_id)
    }

    async fn fetch(&self, job_id: &str) -> Result<JobResponse, ProviderError> {
        let response = self
            .http
            .get(format!(
                "{}/v1/listen/jobs/{}",
                self.config.base_url, job_id
            ))
            .bearer_auth(&self.config.api_key)
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

    /// Poll with exponential backoff until the job is terminal.
    async fn poll(&self, job_id: &str) -> Result<BetaResult, ProviderError> {
        let mut delay = self.config.initial_poll_interval;
        for _ in 0..self.config.max_polls {
            let job = self.retried(|| self.fetch(job_id)).await?;
            match job.state.as_str() {
                "done" => {
                    return job.result.ok_or_else(|| {
                        ProviderError::Parse("job done but result missing".to_string())
                    })
                }
                "failed" => {
                    return Err(ProviderError::Rejected(
                        job.failure
                            .unwrap_or_else(|| "unspecified provider error".to_string()),
                    ))
                }
                "pending" | "running" => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_poll_interval);
                }
                other => {
                    return Err(ProviderError::Parse(format!("unknown job state {other:?}")))
                }
            }
        }
        Err(ProviderError::PollBudgetExhausted(self.config.max_polls))
    }

    async fn retried<F, Fut, T>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        let mut delay = self.config.initial_poll_interval;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!("Beta transient error (attempt {}): {}", attempt, e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_poll_interval);
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
        let job_id = self.retried(|| self.submit(audio_ref, options)).await?;
        let result = self.poll(&job_id).await?;

        let segments: Vec<TranscriptSegment> = result
            .segments
            .into_iter()
            .map(|s| TranscriptSegment {
                start_secs: s.start,
                end_secs: s.end,
                text: s.transcript,
                speaker: s.speaker.map(|n| format!("S{n}")),
                confidence: s.confidence,
            })
            .collect();

        let overall = result
            .confidence
            .unwrap_or_else(|| mean_confidence(&segments));

        info!(
            "Beta transcribed {} into {} segments (confidence {:.2})",
            audio_ref,
            segments.len(),
            overall
        );
        Ok((segments, overall))
    }
}

#[async_trait::async_trait]
impl TranscriptionClient for BetaClient {
    fn id(&self) -> ProviderId {
        ProviderId::Beta
    }

    async fn transcribe(&self, audio_ref: &str, options: &JobOptions) -> ProviderResult {
        match self.run(audio_ref, options).await {
            Ok((segments, overall)) => ProviderResult::success(ProviderId::Beta, segments, overall),
            Err(e) => {
                warn!("Beta failed for {}: {}", audio_ref, e);
                ProviderResult::failed(ProviderId::Beta, e.to_string())
            }
        }
    }
}
