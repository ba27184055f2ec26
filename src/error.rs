use thiserror::Error;

use crate::queue::QueueError;
use crate::sink::SinkError;

/// Errors that fail a single job attempt.
///
/// Provider failures are absorbed into `ProviderResult` and arbitration
/// failures fall back to the confidence rule, so neither shows up here on
/// its own. Only total failure of a processing step reaches this type.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("job deadline of {0}s exceeded")]
    Timeout(u64),
    #[error("no transcription provider enabled for this job")]
    NoProvidersEnabled,
    #[error("all transcription providers failed: {0}")]
    AllProvidersFailed(String),
    #[error("failed to persist result: {0}")]
    Sink(#[from] SinkError),
}
