use axum::{
    extract::{Query, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::cv::handlers::UserIdQuery;
use crate::errors::AppError;
use crate::ratelimit::limiter::RateLimitStatus;
use crate::ratelimit::Plan;
use crate::state::AppState;

#[derive(Serialize)]
pub struct RateLimitUser {
    pub id: Uuid,
    pub plan: Plan,
}

#[derive(Serialize)]
pub struct RateLimitStatusResponse {
    pub user: RateLimitUser,
    #[serde(flatten)]
    pub status: RateLimitStatus,
}

/// GET /api/v1/rate-limits/status
/// Current usage of each per-user scope, without consuming any of it.
pub async fn handle_rate_limit_status(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<RateLimitStatusResponse>, AppError> {
    let plan = Plan::Free;
    let status = state.limiter.status(params.user_id, plan).await?;
    Ok(Json(RateLimitStatusResponse {
        user: RateLimitUser {
            id: params.user_id,
            plan,
        },
        status,
    }))
}
