use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every kind of work that can be handed to the worker, with its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskKind {
    /// Ask the LLM provider for an optimized CV and store it as an AI response.
    GenerateAiResponse { questionnaire_id: Uuid },
    /// Delete AI responses older than the retention window.
    CleanupOldData { retention_days: u32 },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::GenerateAiResponse { .. } => "generate_ai_response",
            TaskKind::CleanupOldData { .. } => "cleanup_old_data",
        }
    }
}

/// A task as it travels through the queue backend.
///
/// `attempt` counts retries already spent: 0 on first delivery. A task runs at
/// most `max_retries + 1` times before it is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub kind: TaskKind,
    pub idempotency_key: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl TaskEnvelope {
    pub fn new(kind: TaskKind, idempotency_key: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            idempotency_key: idempotency_key.into(),
            attempt: 0,
            max_retries,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }

    /// The same task, scheduled for another attempt after `error`.
    pub fn next_attempt(&self, error: &str) -> Self {
        Self {
            attempt: self.attempt + 1,
            last_error: Some(error.to_string()),
            ..self.clone()
        }
    }
}

/// A task that failed permanently or ran out of retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub task: TaskEnvelope,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(task: TaskEnvelope, error: impl Into<String>) -> Self {
        Self {
            task,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}
