use anyhow::Context as _;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod db;
mod error;
mod job;
mod provider;
mod queue;
mod reconcile;
mod sink;
mod worker;

use config::Config;
use job::JobPayload;
use provider::{AlphaClient, BetaClient};
use queue::QueueStore;
use reconcile::{HttpArbiter, Reconciler};
use sink::SqliteSink;
use worker::{Providers, WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        // Operational escape hatch; job submission normally arrives
        // through the API service.
        Some("enqueue") => {
            let audio_ref = args
                .get(2)
                .context("usage: tandem enqueue <audio_ref> [priority]")?;
            let priority = args
                .get(3)
                .map(|p| p.parse::<i64>())
                .transpose()
                .context("priority must be an integer")?
                .unwrap_or(0);

            let pool = db::init_db(&config.database_url)
                .await
                .context("Failed to initialize database")?;
            let queue = QueueStore::new(pool, config.max_attempts);
            let job_id = queue
                .enqueue(&JobPayload::new(audio_ref.clone()), priority)
                .await?;
            println!("{job_id}");
            Ok(())
        }
        Some(other) => anyhow::bail!("unknown command {other:?}"),
        None => run_service(config).await,
    }
}

async fn run_service(config: Config) -> anyhow::Result<()> {
    let pool = db::init_db(&config.database_url)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");

    let queue = QueueStore::new(pool.clone(), config.max_attempts);

    // Pick up whatever a previous run left mid-flight before workers
    // start claiming.
    queue.release_expired_leases(config.lease_secs).await?;

    let providers = Providers {
        alpha: Arc::new(AlphaClient::new(config.alpha.clone())),
        beta: Arc::new(BetaClient::new(config.beta.clone())),
    };
    let arbiter = Arc::new(HttpArbiter::new(config.arbiter.clone()));
    let reconciler = Reconciler::new(config.reconcile.clone(), arbiter);
    let sink = Arc::new(SqliteSink::new(pool));

    let shutdown = CancellationToken::new();
    let worker_pool = WorkerPool::new(
        WorkerConfig::from_config(&config),
        queue,
        providers,
        reconciler,
        sink,
        shutdown.clone(),
    );
    let pool_task = tokio::spawn(worker_pool.run());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();
    pool_task.await.ok();

    Ok(())
}
