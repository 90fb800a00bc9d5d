//! Task handlers: what the worker actually does for each [`TaskKind`].

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::task::{TaskEnvelope, TaskKind};
use crate::cv::ai_responses::{ai_response_exists, delete_ai_responses_before, insert_ai_response};
use crate::cv::questionnaires::get_questionnaire_by_id;
use crate::llm_client::prompts::{build_cv_prompt, CV_SYSTEM};
use crate::llm_client::{LlmClient, LlmError};

#[derive(Debug, Error)]
pub enum TaskError {
    /// Worth another attempt after a backoff.
    #[error("{0}")]
    Retryable(String),

    /// Will fail the same way every time; goes straight to the dead letters.
    #[error("{0}")]
    Permanent(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => TaskError::Permanent(e.to_string()),
            other => TaskError::Retryable(format!("database error: {other}")),
        }
    }
}

impl From<LlmError> for TaskError {
    fn from(e: LlmError) -> Self {
        if e.is_transient() {
            TaskError::Retryable(format!("llm provider: {e}"))
        } else {
            TaskError::Permanent(format!("llm provider: {e}"))
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskEnvelope) -> Result<(), TaskError>;
}

/// Runs CV tasks against the database and the LLM provider.
pub struct CvTaskHandler {
    db: PgPool,
    llm: LlmClient,
}

impl CvTaskHandler {
    pub fn new(db: PgPool, llm: LlmClient) -> Self {
        Self { db, llm }
    }

    async fn generate_ai_response(
        &self,
        task: &TaskEnvelope,
        questionnaire_id: uuid::Uuid,
    ) -> Result<(), TaskError> {
        let key = task.idempotency_key.as_str();

        // A previous delivery may have stored the response but died before acking.
        if ai_response_exists(&self.db, key).await? {
            info!(%questionnaire_id, key, "AI response already stored");
            return Ok(());
        }

        let questionnaire = get_questionnaire_by_id(&self.db, questionnaire_id)
            .await?
            .ok_or_else(|| {
                TaskError::Permanent(format!("questionnaire {questionnaire_id} no longer exists"))
            })?;

        let prompt = build_cv_prompt(&questionnaire);
        let text = self.llm.complete(&prompt, CV_SYSTEM).await?;

        let inserted = insert_ai_response(&self.db, questionnaire_id, &text, key).await?;
        info!(
            %questionnaire_id,
            inserted,
            model = self.llm.model(),
            chars = text.len(),
            "AI response generated"
        );
        Ok(())
    }

    async fn cleanup_old_data(&self, retention_days: u32) -> Result<(), TaskError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let deleted = delete_ai_responses_before(&self.db, cutoff).await?;
        info!(retention_days, deleted, %cutoff, "Old AI responses removed");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for CvTaskHandler {
    async fn handle(&self, task: &TaskEnvelope) -> Result<(), TaskError> {
        match &task.kind {
            TaskKind::GenerateAiResponse { questionnaire_id } => {
                self.generate_ai_response(task, *questionnaire_id).await
            }
            TaskKind::CleanupOldData { retention_days } => {
                self.cleanup_old_data(*retention_days).await
            }
        }
    }
}
