use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use cvimprover::config::Config;
use cvimprover::db::{create_pool, run_migrations};
use cvimprover::jobs::redis_queue::{RedisTaskQueue, DEFAULT_PREFIX};
use cvimprover::ratelimit::{redis_store, RateLimiter, RedisRateLimitStore};
use cvimprover::routes::build_router;
use cvimprover::shutdown::shutdown_signal;
use cvimprover::state::AppState;
use cvimprover::telemetry::init_tracing;
use cvimprover::topology::ProcessRole;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;
    init_tracing(&config, ProcessRole::ApiServer);

    info!("Starting CV Improver API v{}", env!("CARGO_PKG_VERSION"));

    let db = create_pool(&config.database_url, 10).await?;
    if config.run_migrations {
        run_migrations(&db).await?;
    }

    let redis = redis::Client::open(config.redis_url.clone()).context("Invalid REDIS_URL")?;
    // The api never reserves, so its in-flight list stays empty.
    let queue = RedisTaskQueue::connect(&redis, DEFAULT_PREFIX, "api")
        .await
        .context("Failed to connect to the queue backend")?;
    info!("Task queue connected");

    let limits = RedisRateLimitStore::connect(&redis, redis_store::DEFAULT_PREFIX)
        .await
        .context("Failed to connect the rate limit store")?;
    let rate_limit = config.rate_limit();
    info!(
        enabled = rate_limit.enabled,
        per_minute = rate_limit.per_minute,
        per_hour = rate_limit.per_hour,
        "Rate limiter ready"
    );

    let state = AppState {
        db,
        queue: Arc::new(queue),
        limiter: Arc::new(RateLimiter::new(Arc::new(limits), rate_limit)),
        config: config.clone(),
    };

    let app = build_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()), // TODO: restrict origins once the frontend domain is fixed
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    // Peer addresses are the rate limiter's fallback when no proxy header is set.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("API server stopped");
    Ok(())
}
