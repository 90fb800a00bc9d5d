use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct AiResponseRow {
    pub id: Uuid,
    pub questionnaire_id: Uuid,
    pub response_text: String,
    /// Key of the task that produced this row. Unique per table.
    #[serde(skip_serializing)]
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}
