//! Service configuration, loaded from the environment.
//!
//! The alignment and resolution thresholds are deliberately configuration
//! rather than constants; their defaults have no derivation beyond
//! working well so far, and should be tuned against real traffic.

use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::provider::{AlphaConfig, BetaConfig};
use crate::reconcile::{ArbiterConfig, ReconcileConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Number of concurrent workers
    pub pool_size: usize,
    /// Exclusive claim duration; a lapsed lease makes a job reclaimable
    pub lease_secs: i64,
    /// Claim attempts before a job goes dead
    pub max_attempts: i64,
    /// Deadline for one full claim-to-complete pass over a job
    pub job_timeout: Duration,
    /// Sleep between claims when the queue is empty
    pub idle_backoff: Duration,
    /// Interval of the expired-lease sweep
    pub sweep_interval: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_grace: Duration,
    pub reconcile: ReconcileConfig,
    pub alpha: AlphaConfig,
    pub beta: BetaConfig,
    pub arbiter: ArbiterConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut alpha = AlphaConfig {
            api_key: require("ALPHA_API_KEY")?,
            ..AlphaConfig::default()
        };
        if let Ok(url) = std::env::var("ALPHA_BASE_URL") {
            alpha.base_url = url;
        }

        let mut beta = BetaConfig {
            api_key: require("BETA_API_KEY")?,
            ..BetaConfig::default()
        };
        if let Ok(url) = std::env::var("BETA_BASE_URL") {
            beta.base_url = url;
        }

        let mut arbiter = ArbiterConfig {
            api_key: require("ARBITER_API_KEY")?,
            ..ArbiterConfig::default()
        };
        if let Ok(url) = std::env::var("ARBITER_URL") {
            arbiter.url = url;
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/tandem.db?mode=rwc".to_string()),
            pool_size: parse_or("POOL_SIZE", 4),
            lease_secs: parse_or("LEASE_SECS", 300),
            max_attempts: parse_or("MAX_ATTEMPTS", 3),
            job_timeout: Duration::from_secs(parse_or("JOB_TIMEOUT_SECS", 30 * 60)),
            idle_backoff: Duration::from_millis(parse_or("IDLE_BACKOFF_MS", 1000)),
            sweep_interval: Duration::from_secs(parse_or("SWEEP_INTERVAL_SECS", 60)),
            shutdown_grace: Duration::from_secs(parse_or("SHUTDOWN_GRACE_SECS", 30)),
            reconcile: ReconcileConfig {
                overlap_threshold: parse_or("OVERLAP_THRESHOLD", 0.5),
                resolution_threshold: parse_or("RESOLUTION_THRESHOLD", 0.15),
            },
            alpha,
            beta,
            arbiter,
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {} value {:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back() {
        // Unset variable takes the default.
        assert_eq!(parse_or("TANDEM_TEST_UNSET_VAR", 7usize), 7);
    }
}
