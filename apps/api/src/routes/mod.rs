pub mod health;
pub mod rate_limits;
pub mod tasks;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};

use crate::cv::handlers;
use crate::ratelimit::middleware::rate_limit_middleware;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Questionnaires
        .route(
            "/api/v1/questionnaires",
            get(handlers::handle_list_questionnaires).post(handlers::handle_submit_questionnaire),
        )
        .route(
            "/api/v1/questionnaires/:id",
            get(handlers::handle_get_questionnaire).patch(handlers::handle_update_questionnaire),
        )
        // AI responses
        .route(
            "/api/v1/ai-responses",
            get(handlers::handle_list_ai_responses),
        )
        .route(
            "/api/v1/ai-responses/:id",
            get(handlers::handle_get_ai_response),
        )
        // Background tasks
        .route("/api/v1/tasks/failed", get(tasks::handle_list_failed_tasks))
        // Rate limits
        .route(
            "/api/v1/rate-limits/status",
            get(rate_limits::handle_rate_limit_status),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit_middleware,
        ))
        .with_state(state)
}
