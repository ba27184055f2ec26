//! The worker pool: a fixed set of independent claim-process loops.
//!
//! Workers coordinate only through the queue store's atomic claim; there
//! is no shared mutable state here. Each claimed job fans out to both
//! providers concurrently under one job-level deadline, feeds the results
//! through reconciliation, hands the transcript to the sink, and marks
//! the job completed. Any failure in between marks it failed and the
//! queue's retry policy takes over.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::job::Job;
use crate::provider::{ProviderResult, TranscriptionClient};
use crate::queue::QueueStore;
use crate::reconcile::Reconciler;
use crate::sink::ResultSink;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub lease_secs: i64,
    pub job_timeout: Duration,
    pub idle_backoff: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            lease_secs: 300,
            job_timeout: Duration::from_secs(30 * 60),
            idle_backoff: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_size: config.pool_size,
            lease_secs: config.lease_secs,
            job_timeout: config.job_timeout,
            idle_backoff: config.idle_backoff,
            sweep_interval: config.sweep_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// The two transcription backends a worker fans out to.
pub struct Providers {
    pub alpha: Arc<dyn TranscriptionClient>,
    pub beta: Arc<dyn TranscriptionClient>,
}

struct WorkerCtx {
    config: WorkerConfig,
    queue: QueueStore,
    providers: Providers,
    reconciler: Reconciler,
    sink: Arc<dyn ResultSink>,
}

pub struct WorkerPool {
    ctx: Arc<WorkerCtx>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: QueueStore,
        providers: Providers,
        reconciler: Reconciler,
        sink: Arc<dyn ResultSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerCtx {
                config,
                queue,
                providers,
                reconciler,
                sink,
            }),
            shutdown,
        }
    }

    /// Run workers and the lease sweeper until the shutdown token fires,
    /// then drain in-flight jobs within the grace period.
    ///
    /// Jobs still running when the grace period lapses are abandoned;
    /// their leases expire and any other worker (or a restart) picks them
    /// up again.
    pub async fn run(self) {
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.ctx.config.pool_size + 1);

        handles.push(tokio::spawn(sweeper(
            self.ctx.queue.clone(),
            self.ctx.config.lease_secs,
            self.ctx.config.sweep_interval,
            self.shutdown.clone(),
        )));

        for i in 0..self.ctx.config.pool_size {
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(worker_loop(
                ctx,
                format!("worker-{i}"),
                shutdown,
            )));
        }

        info!("Worker pool started with {} workers", self.ctx.config.pool_size);
        self.shutdown.cancelled().await;
        info!("Worker pool draining (grace {:?})", self.ctx.config.shutdown_grace);

        let drain = async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.ctx.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("Grace period elapsed; abandoning in-flight jobs to lease recovery");
            for handle in &handles {
                handle.abort();
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(ctx: Arc<WorkerCtx>, worker_id: String, shutdown: CancellationToken) {
    info!("Worker {} started", worker_id);
    loop {
        let claimed = tokio::select! {
            _ = shutdown.cancelled() => break,
            claimed = ctx.queue.claim(&worker_id, ctx.config.lease_secs) => claimed,
        };

        match claimed {
            Ok(Some(job)) => process_claimed(&ctx, &worker_id, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.idle_backoff) => {}
                }
            }
            Err(e) => {
                error!("Worker {}: claim failed: {}", worker_id, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.config.idle_backoff) => {}
                }
            }
        }
    }
    info!("Worker {} stopped", worker_id);
}

/// One full pass over a claimed job, bounded by the job-level deadline.
///
/// The deadline wraps the whole processing future, so hitting it drops
/// both in-flight provider calls at once.
async fn process_claimed(ctx: &WorkerCtx, worker_id: &str, job: Job) {
    debug!(
        "Worker {} processing job {} (attempt {}/{})",
        worker_id, job.id, job.attempt_count, job.max_attempts
    );

    let deadline_secs = ctx.config.job_timeout.as_secs();
    let outcome = match tokio::time::timeout(
        ctx.config.job_timeout,
        process_job(ctx, worker_id, &job),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(WorkerError::Timeout(deadline_secs)),
    };

    match outcome {
        Ok(result_ref) => {
            if let Err(e) = ctx.queue.mark_completed(&job.id, worker_id, &result_ref).await {
                warn!(
                    "Worker {}: completion of job {} not recorded: {}",
                    worker_id, job.id, e
                );
            }
        }
        Err(e) => {
            match ctx
                .queue
                .mark_failed(&job.id, worker_id, &e.to_string())
                .await
            {
                Ok(status) => debug!("Worker {}: job {} now {}", worker_id, job.id, status),
                Err(e) => warn!(
                    "Worker {}: failure of job {} not recorded: {}",
                    worker_id, job.id, e
                ),
            }
        }
    }
}

async fn process_job(ctx: &WorkerCtx, worker_id: &str, job: &Job) -> Result<String, WorkerError> {
    ctx.queue.mark_processing(&job.id, worker_id).await?;

    let audio_ref = &job.payload.audio_ref;
    let options = &job.payload.options;

    let results: Vec<ProviderResult> = match (options.alpha_enabled, options.beta_enabled) {
        (true, true) => {
            let (a, b) = tokio::join!(
                ctx.providers.alpha.transcribe(audio_ref, options),
                ctx.providers.beta.transcribe(audio_ref, options),
            );
            vec![a, b]
        }
        (true, false) => vec![ctx.providers.alpha.transcribe(audio_ref, options).await],
        (false, true) => vec![ctx.providers.beta.transcribe(audio_ref, options).await],
        (false, false) => return Err(WorkerError::NoProvidersEnabled),
    };

    if results.iter().all(|r| !r.is_success()) {
        let reasons: Vec<&str> = results.iter().filter_map(|r| r.failure_reason()).collect();
        return Err(WorkerError::AllProvidersFailed(reasons.join("; ")));
    }

    let transcript = ctx.reconciler.reconcile(&job.id, &results).await;
    let result_ref = ctx.sink.persist(&transcript).await?;
    Ok(result_ref)
}

/// Periodic crash-recovery sweep over lapsed leases.
async fn sweeper(
    queue: QueueStore,
    lease_secs: i64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = queue.release_expired_leases(lease_secs).await {
            error!("Lease sweep failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::job::{JobPayload, JobStatus};
    use crate::provider::{ProviderId, TranscriptSegment};
    use crate::reconcile::{
        Arbiter, ArbiterError, Arbitration, ArbitrationRequest, ReconcileConfig,
    };
    use crate::sink::SqliteSink;
    use async_trait::async_trait;

    struct NeverArbiter;

    #[async_trait]
    impl Arbiter for NeverArbiter {
        async fn resolve(
            &self,
            _request: &ArbitrationRequest,
        ) -> Result<Arbitration, ArbiterError> {
            Err(ArbiterError::Api {
                status: 503,
                message: "test arbiter offline".to_string(),
            })
        }
    }

    /// Client that answers instantly with canned segments.
    struct CannedClient {
        id: ProviderId,
        segments: Vec<TranscriptSegment>,
    }

    #[async_trait]
    impl TranscriptionClient for CannedClient {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn transcribe(
            &self,
            _audio_ref: &str,
            _options: &crate::job::JobOptions,
        ) -> ProviderResult {
            ProviderResult::success(self.id, self.segments.clone(), 0.9)
        }
    }

    /// Client that always fails.
    struct BrokenClient {
        id: ProviderId,
    }

    #[async_trait]
    impl TranscriptionClient for BrokenClient {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn transcribe(
            &self,
            _audio_ref: &str,
            _options: &crate::job::JobOptions,
        ) -> ProviderResult {
            ProviderResult::failed(self.id, "simulated outage")
        }
    }

    fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start_secs: start,
            end_secs: end,
            text: text.to_string(),
            speaker: None,
            confidence: 0.9,
        }
    }

    fn test_worker_config() -> WorkerConfig {
        WorkerConfig {
            pool_size: 1,
            lease_secs: 300,
            job_timeout: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    async fn wait_for_status(
        queue: &QueueStore,
        job_id: &str,
        wanted: JobStatus,
    ) -> crate::job::Job {
        for _ in 0..200 {
            let job = queue.get(job_id).await.unwrap().unwrap();
            if job.status == wanted {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {wanted}");
    }

    #[tokio::test]
    async fn test_pool_completes_job_end_to_end() {
        let pool = test_pool().await;
        let queue = QueueStore::new(pool.clone(), 3);
        let sink = Arc::new(SqliteSink::new(pool));

        let providers = Providers {
            alpha: Arc::new(CannedClient {
                id: ProviderId::Alpha,
                segments: vec![seg(0.0, 2.0, "hello world")],
            }),
            beta: Arc::new(CannedClient {
                id: ProviderId::Beta,
                segments: vec![seg(0.0, 2.0, "Hello, world")],
            }),
        };
        let reconciler = Reconciler::new(ReconcileConfig::default(), Arc::new(NeverArbiter));

        let shutdown = CancellationToken::new();
        let worker_pool = WorkerPool::new(
            test_worker_config(),
            queue.clone(),
            providers,
            reconciler,
            sink.clone(),
            shutdown.clone(),
        );
        let pool_task = tokio::spawn(worker_pool.run());

        let job_id = queue
            .enqueue(&JobPayload::new("s3://bucket/meeting.wav"), 0)
            .await
            .unwrap();

        let job = wait_for_status(&queue, &job_id, JobStatus::Completed).await;
        assert!(job.result_ref.is_some());

        let transcript = sink.load(&job_id).await.unwrap().unwrap();
        assert_eq!(transcript.final_segments.len(), 1);
        assert_eq!(transcript.quality.provider_agreement_rate, Some(1.0));

        shutdown.cancel();
        pool_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_provider_outage_degrades_but_completes() {
        let pool = test_pool().await;
        let queue = QueueStore::new(pool.clone(), 3);
        let sink = Arc::new(SqliteSink::new(pool));

        let providers = Providers {
            alpha: Arc::new(CannedClient {
                id: ProviderId::Alpha,
                segments: vec![seg(0.0, 2.0, "only me")],
            }),
            beta: Arc::new(BrokenClient {
                id: ProviderId::Beta,
            }),
        };
        let reconciler = Reconciler::new(ReconcileConfig::default(), Arc::new(NeverArbiter));

        let shutdown = CancellationToken::new();
        let worker_pool = WorkerPool::new(
            test_worker_config(),
            queue.clone(),
            providers,
            reconciler,
            sink.clone(),
            shutdown.clone(),
        );
        let pool_task = tokio::spawn(worker_pool.run());

        let job_id = queue
            .enqueue(&JobPayload::new("s3://bucket/a.wav"), 0)
            .await
            .unwrap();

        wait_for_status(&queue, &job_id, JobStatus::Completed).await;
        let transcript = sink.load(&job_id).await.unwrap().unwrap();
        assert_eq!(transcript.final_segments[0].text, "only me");
        assert_eq!(transcript.quality.provider_agreement_rate, None);

        shutdown.cancel();
        pool_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_total_outage_retries_job_to_dead() {
        let pool = test_pool().await;
        let queue = QueueStore::new(pool.clone(), 3);
        let sink = Arc::new(SqliteSink::new(pool));

        let providers = Providers {
            alpha: Arc::new(BrokenClient {
                id: ProviderId::Alpha,
            }),
            beta: Arc::new(BrokenClient {
                id: ProviderId::Beta,
            }),
        };
        let reconciler = Reconciler::new(ReconcileConfig::default(), Arc::new(NeverArbiter));

        let shutdown = CancellationToken::new();
        let worker_pool = WorkerPool::new(
            test_worker_config(),
            queue.clone(),
            providers,
            reconciler,
            sink,
            shutdown.clone(),
        );
        let pool_task = tokio::spawn(worker_pool.run());

        let job_id = queue
            .enqueue(&JobPayload::new("s3://bucket/a.wav"), 0)
            .await
            .unwrap();

        let job = wait_for_status(&queue, &job_id, JobStatus::Dead).await;
        assert_eq!(job.attempt_count, 3);
        assert!(job
            .last_error
            .as_deref()
            .unwrap()
            .contains("all transcription providers failed"));

        shutdown.cancel();
        pool_task.await.unwrap();
    }
}
