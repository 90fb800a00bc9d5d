//! Redis-backed task queue.
//!
//! Layout under `{prefix}`:
//! - `ready`: list, producers LPUSH, workers BLMOVE from the right
//! - `in_flight:{consumer}`: list of tasks a named worker is executing
//! - `delayed`: sorted set of retries scored by due time (ms since epoch)
//! - `dead`: list of dead letters, newest first, capped

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, error, info, warn};

use super::queue::{QueueError, Reservation, TaskQueue};
use super::task::{DeadLetter, TaskEnvelope};

pub const DEFAULT_PREFIX: &str = "cvimprover:tasks";
pub const DEFAULT_DEAD_LETTER_MAX_LEN: u64 = 10_000;
const PROMOTE_BATCH: usize = 100;

const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, raw in ipairs(due) do
    redis.call('ZREM', KEYS[1], raw)
    redis.call('LPUSH', KEYS[2], raw)
end
return #due
"#;

#[derive(Debug, Clone)]
struct QueueKeys {
    ready: String,
    in_flight: String,
    delayed: String,
    dead: String,
}

impl QueueKeys {
    fn new(prefix: &str, consumer: &str) -> Self {
        Self {
            ready: format!("{prefix}:ready"),
            in_flight: format!("{prefix}:in_flight:{consumer}"),
            delayed: format!("{prefix}:delayed"),
            dead: format!("{prefix}:dead"),
        }
    }
}

/// Task queue on Redis lists.
///
/// `consumer` names the in-flight list. A worker restarted under the same name
/// recovers exactly the tasks its previous run left behind.
pub struct RedisTaskQueue {
    conn: MultiplexedConnection,
    /// Dedicated connection for BLMOVE so blocking waits never stall other commands.
    blocking: MultiplexedConnection,
    keys: QueueKeys,
    promote: Script,
    dead_letter_max_len: u64,
}

impl RedisTaskQueue {
    pub async fn connect(
        client: &redis::Client,
        prefix: &str,
        consumer: &str,
    ) -> Result<Self, QueueError> {
        let conn = client.get_multiplexed_async_connection().await?;
        let blocking = client.get_multiplexed_async_connection().await?;
        info!(prefix, consumer, "Connected task queue to Redis");
        Ok(Self {
            conn,
            blocking,
            keys: QueueKeys::new(prefix, consumer),
            promote: Script::new(PROMOTE_DUE_SCRIPT),
            dead_letter_max_len: DEFAULT_DEAD_LETTER_MAX_LEN,
        })
    }

    /// Caps the dead-letter list; the oldest entries beyond `max` are dropped.
    pub fn with_dead_letter_max_len(mut self, max: u64) -> Self {
        self.dead_letter_max_len = max.max(1);
        self
    }
}

/// How many entries a list of `len` loses when trimmed to `max`.
fn overflow(len: u64, max: u64) -> u64 {
    len.saturating_sub(max)
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &TaskEnvelope) -> Result<(), QueueError> {
        let raw = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(&self.keys.ready)
            .arg(&raw)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(task_id = %task.id, task = task.name(), "Enqueued task");
        Ok(())
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Reservation>, QueueError> {
        let mut conn = self.blocking.clone();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.keys.ready)
            .arg(&self.keys.in_flight)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match Reservation::decode(raw.clone()) {
            Ok(reservation) => Ok(Some(reservation)),
            Err(e) => {
                error!(error = %e, "Discarding malformed task payload");
                let mut conn = self.conn.clone();
                redis::cmd("LREM")
                    .arg(&self.keys.in_flight)
                    .arg(1)
                    .arg(&raw)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                Err(QueueError::Malformed(e.to_string()))
            }
        }
    }

    async fn ack(&self, reservation: &Reservation) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("LREM")
            .arg(&self.keys.in_flight)
            .arg(1)
            .arg(&reservation.receipt)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(
        &self,
        reservation: &Reservation,
        task: &TaskEnvelope,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_string(task)?;
        let due_at = Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&self.keys.delayed)
            .arg(due_at)
            .arg(&raw)
            .ignore()
            .cmd("LREM")
            .arg(&self.keys.in_flight)
            .arg(1)
            .arg(&reservation.receipt)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        reservation: &Reservation,
        letter: &DeadLetter,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_string(letter)?;
        let mut conn = self.conn.clone();
        let (len,): (u64,) = redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&self.keys.dead)
            .arg(&raw)
            .cmd("LTRIM")
            .arg(&self.keys.dead)
            .arg(0)
            .arg(self.dead_letter_max_len.saturating_sub(1))
            .ignore()
            .cmd("LREM")
            .arg(&self.keys.in_flight)
            .arg(1)
            .arg(&reservation.receipt)
            .ignore()
            .query_async(&mut conn)
            .await?;
        let dropped = overflow(len, self.dead_letter_max_len);
        if dropped > 0 {
            warn!(
                dropped,
                max_len = self.dead_letter_max_len,
                "Dead-letter list full, dropped oldest entries"
            );
        }
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.promote.prepare_invoke();
        invocation
            .key(&self.keys.delayed)
            .key(&self.keys.ready)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH);
        let moved: usize = invocation.invoke_async(&mut conn).await?;
        if moved > 0 {
            debug!(moved, "Promoted delayed retries");
        }
        Ok(moved)
    }

    async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.in_flight)
                .arg(&self.keys.ready)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("LLEN")
            .arg(&self.keys.dead)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn dead_letters(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetter>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = i64::try_from(offset).unwrap_or(i64::MAX);
        let stop = start.saturating_add(i64::try_from(limit).unwrap_or(i64::MAX) - 1);
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.keys.dead)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        raw.iter()
            .map(|r| serde_json::from_str(r).map_err(QueueError::from))
            .collect()
    }
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
