use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::questionnaire::{CreateQuestionnaire, QuestionnaireRow, UpdateQuestionnaire};
use crate::pagination::source::{sql_bound, sql_count};
use crate::pagination::PageSource;

/// Optional free-text fields are stored trimmed, like the required ones.
fn trimmed(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim)
}

pub async fn insert_questionnaire(
    pool: &PgPool,
    req: &CreateQuestionnaire,
) -> Result<QuestionnaireRow, sqlx::Error> {
    sqlx::query_as::<_, QuestionnaireRow>(
        r#"
        INSERT INTO questionnaires
            (id, user_id, position, industry, experience_level, company_size,
             location, application_timeline, job_description)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(req.user_id)
    .bind(req.position.trim())
    .bind(req.industry.trim())
    .bind(req.experience_level.as_str())
    .bind(req.company_size.as_str())
    .bind(trimmed(&req.location))
    .bind(req.application_timeline.as_str())
    .bind(trimmed(&req.job_description))
    .fetch_one(pool)
    .await
}

/// Fetches a questionnaire only if it belongs to `user_id`.
pub async fn get_questionnaire(
    pool: &PgPool,
    id: Uuid,
    user_id: Uuid,
) -> Result<Option<QuestionnaireRow>, sqlx::Error> {
    sqlx::query_as::<_, QuestionnaireRow>(
        "SELECT * FROM questionnaires WHERE id = $1 AND user_id = $2",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_questionnaire_by_id(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<QuestionnaireRow>, sqlx::Error> {
    sqlx::query_as::<_, QuestionnaireRow>("SELECT * FROM questionnaires WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Applies the fields present in `req`; returns `None` if the row is not the user's.
pub async fn update_questionnaire(
    pool: &PgPool,
    id: Uuid,
    req: &UpdateQuestionnaire,
) -> Result<Option<QuestionnaireRow>, sqlx::Error> {
    sqlx::query_as::<_, QuestionnaireRow>(
        r#"
        UPDATE questionnaires SET
            position = COALESCE($3, position),
            industry = COALESCE($4, industry),
            experience_level = COALESCE($5, experience_level),
            company_size = COALESCE($6, company_size),
            location = COALESCE($7, location),
            application_timeline = COALESCE($8, application_timeline),
            job_description = COALESCE($9, job_description)
        WHERE id = $1 AND user_id = $2
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(req.user_id)
    .bind(trimmed(&req.position))
    .bind(trimmed(&req.industry))
    .bind(req.experience_level.map(|v| v.as_str()))
    .bind(req.company_size.map(|v| v.as_str()))
    .bind(trimmed(&req.location))
    .bind(req.application_timeline.map(|v| v.as_str()))
    .bind(trimmed(&req.job_description))
    .fetch_optional(pool)
    .await
}

#[derive(Debug, Clone)]
pub struct QuestionnaireFilter {
    pub user_id: Uuid,
    pub industry: Option<String>,
    pub experience_level: Option<String>,
}

/// A user's questionnaires, newest first.
pub struct QuestionnairePages {
    pool: PgPool,
    filter: QuestionnaireFilter,
}

impl QuestionnairePages {
    pub fn new(pool: PgPool, filter: QuestionnaireFilter) -> Self {
        Self { pool, filter }
    }
}

#[async_trait]
impl PageSource for QuestionnairePages {
    type Item = QuestionnaireRow;
    type Error = sqlx::Error;

    async fn count(&self) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM questionnaires
            WHERE user_id = $1
              AND ($2::text IS NULL OR industry = $2)
              AND ($3::text IS NULL OR experience_level = $3)
            "#,
        )
        .bind(self.filter.user_id)
        .bind(self.filter.industry.as_deref())
        .bind(self.filter.experience_level.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(sql_count(count))
    }

    async fn slice(&self, offset: u64, limit: u64) -> Result<Vec<QuestionnaireRow>, sqlx::Error> {
        sqlx::query_as::<_, QuestionnaireRow>(
            r#"
            SELECT * FROM questionnaires
            WHERE user_id = $1
              AND ($2::text IS NULL OR industry = $2)
              AND ($3::text IS NULL OR experience_level = $3)
            ORDER BY submitted_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(self.filter.user_id)
        .bind(self.filter.industry.as_deref())
        .bind(self.filter.experience_level.as_deref())
        .bind(sql_bound(limit))
        .bind(sql_bound(offset))
        .fetch_all(&self.pool)
        .await
    }
}
