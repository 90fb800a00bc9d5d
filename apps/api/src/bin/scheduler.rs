use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use cvimprover::config::Config;
use cvimprover::jobs::{
    RecurringTask, RedisScheduleStore, RedisTaskQueue, Scheduler, TaskKind, DEFAULT_PREFIX,
};
use cvimprover::shutdown::shutdown_channel;
use cvimprover::telemetry::init_tracing;
use cvimprover::topology::ProcessRole;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config, ProcessRole::Scheduler);

    info!("Starting CV Improver scheduler v{}", env!("CARGO_PKG_VERSION"));

    let redis = redis::Client::open(config.redis_url.clone()).context("Invalid REDIS_URL")?;
    let queue = RedisTaskQueue::connect(&redis, DEFAULT_PREFIX, "scheduler")
        .await
        .context("Failed to connect to the queue backend")?;
    let store = RedisScheduleStore::connect(&redis, DEFAULT_PREFIX)
        .await
        .context("Failed to connect to the schedule store")?;

    let entries = vec![RecurringTask::new(
        TaskKind::CleanupOldData {
            retention_days: config.retention_days,
        },
        Duration::from_secs(config.cleanup_interval_secs.max(1)),
    )];

    let scheduler = Scheduler::new(
        Arc::new(store),
        Arc::new(queue),
        entries,
        Duration::from_secs(config.scheduler_tick_secs.max(1)),
        config.task_max_retries,
    );

    scheduler.run(shutdown_channel()).await;
    info!("Scheduler stopped");
    Ok(())
}
