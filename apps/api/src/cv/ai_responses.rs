use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::ai_response::AiResponseRow;
use crate::pagination::source::{sql_bound, sql_count};
use crate::pagination::PageSource;

/// Stores a generated response under `idempotency_key`.
/// Returns `false` when a response with that key already exists.
pub async fn insert_ai_response(
    pool: &PgPool,
    questionnaire_id: Uuid,
    response_text: &str,
    idempotency_key: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO ai_responses (id, questionnaire_id, response_text, idempotency_key)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(questionnaire_id)
    .bind(response_text)
    .bind(idempotency_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn ai_response_exists(pool: &PgPool, idempotency_key: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM ai_responses WHERE idempotency_key = $1)")
        .bind(idempotency_key)
        .fetch_one(pool)
        .await
}

/// Fetches a response only if its questionnaire belongs to `user_id`.
pub async fn get_ai_response(
    pool: &PgPool,
    id: Uuid,
    user_id: Uuid,
) -> Result<Option<AiResponseRow>, sqlx::Error> {
    sqlx::query_as::<_, AiResponseRow>(
        r#"
        SELECT r.* FROM ai_responses r
        JOIN questionnaires q ON q.id = r.questionnaire_id
        WHERE r.id = $1 AND q.user_id = $2
        "#,
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn delete_ai_responses_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM ai_responses WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone)]
pub struct AiResponseFilter {
    pub user_id: Uuid,
    pub questionnaire_id: Option<Uuid>,
}

/// AI responses across a user's questionnaires, newest first.
pub struct AiResponsePages {
    pool: PgPool,
    filter: AiResponseFilter,
}

impl AiResponsePages {
    pub fn new(pool: PgPool, filter: AiResponseFilter) -> Self {
        Self { pool, filter }
    }
}

#[async_trait]
impl PageSource for AiResponsePages {
    type Item = AiResponseRow;
    type Error = sqlx::Error;

    async fn count(&self) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM ai_responses r
            JOIN questionnaires q ON q.id = r.questionnaire_id
            WHERE q.user_id = $1
              AND ($2::uuid IS NULL OR r.questionnaire_id = $2)
            "#,
        )
        .bind(self.filter.user_id)
        .bind(self.filter.questionnaire_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(sql_count(count))
    }

    async fn slice(&self, offset: u64, limit: u64) -> Result<Vec<AiResponseRow>, sqlx::Error> {
        sqlx::query_as::<_, AiResponseRow>(
            r#"
            SELECT r.* FROM ai_responses r
            JOIN questionnaires q ON q.id = r.questionnaire_id
            WHERE q.user_id = $1
              AND ($2::uuid IS NULL OR r.questionnaire_id = $2)
            ORDER BY r.created_at DESC, r.id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(self.filter.user_id)
        .bind(self.filter.questionnaire_id)
        .bind(sql_bound(limit))
        .bind(sql_bound(offset))
        .fetch_all(&self.pool)
        .await
    }
}
