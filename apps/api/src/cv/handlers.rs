use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::cv::ai_responses::{get_ai_response, AiResponseFilter, AiResponsePages};
use crate::cv::questionnaires::{
    get_questionnaire, insert_questionnaire, update_questionnaire, QuestionnaireFilter,
    QuestionnairePages,
};
use crate::cv::validation::{validate_create, validate_update};
use crate::errors::AppError;
use crate::jobs::task::{TaskEnvelope, TaskKind};
use crate::models::ai_response::AiResponseRow;
use crate::models::questionnaire::{
    CreateQuestionnaire, ExperienceLevel, QuestionnaireRow, UpdateQuestionnaire,
};
use crate::pagination::{paginate, Page, Pagination};
use crate::ratelimit::{Plan, Scope};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct QuestionnaireListQuery {
    pub user_id: Uuid,
    pub industry: Option<String>,
    pub experience_level: Option<ExperienceLevel>,
}

#[derive(Deserialize)]
pub struct AiResponseListQuery {
    pub user_id: Uuid,
    pub questionnaire_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct QuestionnaireSubmitted {
    pub questionnaire: QuestionnaireRow,
    pub task_id: Uuid,
}

/// Key under which the AI response of a questionnaire is generated exactly once.
pub fn generation_key(questionnaire_id: Uuid) -> String {
    format!("generate_ai_response:{questionnaire_id}")
}

/// GET /api/v1/questionnaires
pub async fn handle_list_questionnaires(
    State(state): State<AppState>,
    Query(params): Query<QuestionnaireListQuery>,
    pagination: Pagination,
) -> Result<Json<Page<QuestionnaireRow>>, AppError> {
    let source = QuestionnairePages::new(
        state.db.clone(),
        QuestionnaireFilter {
            user_id: params.user_id,
            industry: params.industry,
            experience_level: params.experience_level.map(|l| l.as_str().to_string()),
        },
    );
    let page = paginate(&source, pagination.request, &pagination.links).await?;
    Ok(Json(page))
}

/// POST /api/v1/questionnaires
///
/// Stores the questionnaire and hands AI generation to the worker.
/// Each submission uses one questionnaire and one AI response of the user's daily budget.
pub async fn handle_submit_questionnaire(
    State(state): State<AppState>,
    Json(req): Json<CreateQuestionnaire>,
) -> Result<(StatusCode, Json<QuestionnaireSubmitted>), AppError> {
    validate_create(&req)?;

    // No billing yet: every user is on the free plan.
    let plan = Plan::Free;
    if state.limiter.config().enabled {
        let decision = state
            .limiter
            .check_scopes(req.user_id, plan, &[Scope::Questionnaires, Scope::AiResponses])
            .await?;
        if !decision.allowed {
            info!(user_id = %req.user_id, ?plan, "Daily submission limit reached");
            return Err(AppError::RateLimited {
                message: format!("Daily questionnaire limit reached for the {plan:?} plan"),
                retry_after: decision.retry_after(),
            });
        }
    }

    let questionnaire = insert_questionnaire(&state.db, &req).await?;

    let task = TaskEnvelope::new(
        TaskKind::GenerateAiResponse {
            questionnaire_id: questionnaire.id,
        },
        generation_key(questionnaire.id),
        state.config.task_max_retries,
    );
    state.queue.enqueue(&task).await?;
    info!(
        questionnaire_id = %questionnaire.id,
        task_id = %task.id,
        "Questionnaire submitted, AI generation queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(QuestionnaireSubmitted {
            questionnaire,
            task_id: task.id,
        }),
    ))
}

/// GET /api/v1/questionnaires/:id
pub async fn handle_get_questionnaire(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<QuestionnaireRow>, AppError> {
    get_questionnaire(&state.db, id, params.user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Questionnaire {id} not found")))
}

/// PATCH /api/v1/questionnaires/:id
pub async fn handle_update_questionnaire(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateQuestionnaire>,
) -> Result<Json<QuestionnaireRow>, AppError> {
    validate_update(&req)?;
    update_questionnaire(&state.db, id, &req)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Questionnaire {id} not found")))
}

/// GET /api/v1/ai-responses
pub async fn handle_list_ai_responses(
    State(state): State<AppState>,
    Query(params): Query<AiResponseListQuery>,
    pagination: Pagination,
) -> Result<Json<Page<AiResponseRow>>, AppError> {
    let source = AiResponsePages::new(
        state.db.clone(),
        AiResponseFilter {
            user_id: params.user_id,
            questionnaire_id: params.questionnaire_id,
        },
    );
    let page = paginate(&source, pagination.request, &pagination.links).await?;
    Ok(Json(page))
}

/// GET /api/v1/ai-responses/:id
pub async fn handle_get_ai_response(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<AiResponseRow>, AppError> {
    get_ai_response(&state.db, id, params.user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("AI response {id} not found")))
}
