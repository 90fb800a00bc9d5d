use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::PgPool;

use crate::config::Config;
use crate::jobs::queue::TaskQueue;
use crate::pagination::PaginationConfig;
use crate::ratelimit::RateLimiter;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    /// The api only enqueues; tasks are executed by the worker process.
    pub queue: Arc<dyn TaskQueue>,
    pub limiter: Arc<RateLimiter>,
    pub config: Config,
}

impl FromRef<AppState> for PaginationConfig {
    fn from_ref(state: &AppState) -> Self {
        state.config.pagination()
    }
}
