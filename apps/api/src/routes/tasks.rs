use std::sync::Arc;

use axum::{extract::State, Json};

use crate::errors::AppError;
use crate::jobs::queue::DeadLetterPages;
use crate::jobs::task::DeadLetter;
use crate::pagination::{paginate, Page, Pagination};
use crate::state::AppState;

/// GET /api/v1/tasks/failed
/// Tasks that exhausted their retries or failed permanently, newest first.
pub async fn handle_list_failed_tasks(
    State(state): State<AppState>,
    pagination: Pagination,
) -> Result<Json<Page<DeadLetter>>, AppError> {
    let source = DeadLetterPages::new(Arc::clone(&state.queue));
    let page = paginate(&source, pagination.request, &pagination.links).await?;
    Ok(Json(page))
}
