use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use cvimprover::config::Config;
use cvimprover::db::{create_pool, worker_pool_size};
use cvimprover::jobs::{
    CvTaskHandler, RedisIdempotencyStore, RedisTaskQueue, Worker, WorkerSettings, DEFAULT_PREFIX,
};
use cvimprover::llm_client::LlmClient;
use cvimprover::shutdown::shutdown_channel;
use cvimprover::telemetry::init_tracing;
use cvimprover::topology::ProcessRole;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config, ProcessRole::Worker);

    let concurrency = config.worker_concurrency.max(1);
    info!(
        worker = %config.worker_name,
        concurrency,
        "Starting CV Improver worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = create_pool(&config.database_url, worker_pool_size(concurrency)).await?;

    let llm = LlmClient::new(config.require_openai_key()?, config.openai_model.clone())?;
    info!(model = llm.model(), "LLM client initialized");

    let redis = redis::Client::open(config.redis_url.clone()).context("Invalid REDIS_URL")?;
    let queue = RedisTaskQueue::connect(&redis, DEFAULT_PREFIX, &config.worker_name)
        .await
        .context("Failed to connect to the queue backend")?
        .with_dead_letter_max_len(config.dead_letter_max_len);
    let idempotency = RedisIdempotencyStore::connect(&redis, DEFAULT_PREFIX)
        .await
        .context("Failed to connect to the idempotency store")?;

    let worker = Worker::new(
        Arc::new(queue),
        Arc::new(CvTaskHandler::new(db, llm)),
        Arc::new(idempotency),
        WorkerSettings {
            concurrency,
            reserve_timeout: Duration::from_secs(2),
            retry: config.retry_policy(),
        },
    );

    worker.run(shutdown_channel()).await?;
    info!("Worker stopped");
    Ok(())
}
