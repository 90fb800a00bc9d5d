use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::queue::QueueError;

/// How long a completed key is remembered. Redeliveries happen within minutes.
const COMPLETED_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Records which idempotency keys already produced their side effect.
///
/// The queue backend may deliver a task more than once and does not dedupe,
/// so the worker consults this before running a handler.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_completed(&self, key: &str) -> Result<bool, QueueError>;
    async fn mark_completed(&self, key: &str) -> Result<(), QueueError>;
}

pub struct RedisIdempotencyStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(client: &redis::Client, prefix: &str) -> Result<Self, QueueError> {
        Ok(Self {
            conn: client.get_multiplexed_async_connection().await?,
            prefix: format!("{prefix}:completed"),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn is_completed(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn mark_completed(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("EX")
            .arg(COMPLETED_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    completed: Mutex<HashSet<String>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_completed(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.completed.lock().await.contains(key))
    }

    async fn mark_completed(&self, key: &str) -> Result<(), QueueError> {
        self.completed.lock().await.insert(key.to_string());
        Ok(())
    }
}
