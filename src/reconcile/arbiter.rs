//! Arbitration of ambiguous discrepancies via an external reasoning
//! service.
//!
//! The service is opaque, possibly slow, and possibly rate-limited: one
//! POST with the surrounding context and both candidate texts, one JSON
//! answer back. Transient failures are retried with backoff; callers fall
//! back to the confidence rule when the arbiter stays unavailable, so
//! this module never decides job outcomes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ArbitrationRequest {
    /// Transcript text preceding the disputed segment
    pub context: String,
    pub text_a: String,
    pub text_b: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Arbitration {
    pub final_text: String,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("arbiter returned empty text")]
    EmptyAnswer,
}

impl ArbiterError {
    fn is_transient(&self) -> bool {
        match self {
            ArbiterError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ArbiterError::Api { status, .. } => *status == 429 || *status >= 500,
            ArbiterError::EmptyAnswer => false,
        }
    }
}

/// Resolves a disputed segment to a final text.
#[async_trait]
pub trait Arbiter: Send + Sync {
    async fn resolve(&self, request: &ArbitrationRequest) -> Result<Arbitration, ArbiterError>;
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub url: String,
    pub api_key: String,
    /// Total attempts per discrepancy
    pub max_attempts: u32,
    /// Initial retry backoff; doubles per attempt
    pub initial_backoff: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            url: "https://api.arbiter.example.com/v1/resolve".to_string(),
            api_key: String::new(),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// HTTP-backed arbiter client.
pub struct HttpArbiter {
    http: reqwest::Client,
    config: ArbiterConfig,
}

impl HttpArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn call(&self, request: &ArbitrationRequest) -> Result<Arbitration, ArbiterError> {
        let response = self
            .http
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ArbiterError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let arbitration: Arbitration = response.json().await?;
        if arbitration.final_text.trim().is_empty() {
            return Err(ArbiterError::EmptyAnswer);
        }
        Ok(arbitration)
    }
}

#[async_trait]
impl Arbiter for HttpArbiter {
    async fn resolve(&self, request: &ArbitrationRequest) -> Result<Arbitration, ArbiterError> {
        let mut delay = self.config.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call(request).await {
                Ok(arbitration) => {
                    debug!("Arbiter resolved after {} attempt(s)", attempt);
                    return Ok(arbitration);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!("Arbiter transient error (attempt {}): {}", attempt, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
