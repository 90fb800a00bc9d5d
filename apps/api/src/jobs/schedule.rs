//! Recurring task scheduling with externally persisted fire state.
//!
//! Time is cut into slots of each task's interval. A slot is recorded in the
//! store only after its task was enqueued, so a restarted scheduler skips slots
//! that already fired and retries ones whose enqueue failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::queue::{QueueError, TaskQueue};
use super::task::{TaskEnvelope, TaskKind};

const CLAIM_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '-1')
if tonumber(ARGV[2]) > current then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

/// Last fired slot per task name, kept outside the scheduler process.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn last_fired(&self, task: &str) -> Result<Option<i64>, QueueError>;

    /// Atomically records `slot` for `task` if it is newer than the stored one.
    /// Returns whether this caller won the slot.
    async fn try_claim(&self, task: &str, slot: i64) -> Result<bool, QueueError>;
}

pub struct RedisScheduleStore {
    conn: MultiplexedConnection,
    key: String,
    claim: Script,
}

impl RedisScheduleStore {
    pub async fn connect(client: &redis::Client, prefix: &str) -> Result<Self, QueueError> {
        Ok(Self {
            conn: client.get_multiplexed_async_connection().await?,
            key: format!("{prefix}:schedule"),
            claim: Script::new(CLAIM_SCRIPT),
        })
    }
}

#[async_trait]
impl ScheduleStore for RedisScheduleStore {
    async fn last_fired(&self, task: &str) -> Result<Option<i64>, QueueError> {
        let mut conn = self.conn.clone();
        let slot: Option<i64> = redis::cmd("HGET")
            .arg(&self.key)
            .arg(task)
            .query_async(&mut conn)
            .await?;
        Ok(slot)
    }

    async fn try_claim(&self, task: &str, slot: i64) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.claim.prepare_invoke();
        invocation.key(&self.key).arg(task).arg(slot);
        let won: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(won == 1)
    }
}

#[derive(Default)]
pub struct InMemoryScheduleStore {
    fired: Mutex<HashMap<String, i64>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn last_fired(&self, task: &str) -> Result<Option<i64>, QueueError> {
        Ok(self.fired.lock().await.get(task).copied())
    }

    async fn try_claim(&self, task: &str, slot: i64) -> Result<bool, QueueError> {
        let mut fired = self.fired.lock().await;
        match fired.get(task) {
            Some(current) if *current >= slot => Ok(false),
            _ => {
                fired.insert(task.to_string(), slot);
                Ok(true)
            }
        }
    }
}

/// A task enqueued once per `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringTask {
    pub kind: TaskKind,
    pub interval: Duration,
}

impl RecurringTask {
    pub fn new(kind: TaskKind, interval: Duration) -> Self {
        Self { kind, interval }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Start of the slot containing `now`, in seconds since the epoch.
    pub fn slot_at(&self, now: DateTime<Utc>) -> i64 {
        let interval = i64::try_from(self.interval.as_secs().max(1)).unwrap_or(i64::MAX);
        let now = now.timestamp();
        now - now.rem_euclid(interval)
    }

    pub fn idempotency_key(&self, slot: i64) -> String {
        format!("{}:{slot}", self.name())
    }
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    queue: Arc<dyn TaskQueue>,
    entries: Vec<RecurringTask>,
    tick: Duration,
    max_retries: u32,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        queue: Arc<dyn TaskQueue>,
        entries: Vec<RecurringTask>,
        tick: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            entries,
            tick,
            max_retries,
        }
    }

    /// Enqueues every entry whose current slot has not fired yet.
    ///
    /// The slot is claimed only after the enqueue succeeded, so a failed enqueue
    /// is retried on the next tick. Two schedulers racing for one slot may both
    /// enqueue; the copies share the slot's idempotency key and run once.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut enqueued = 0;
        for entry in &self.entries {
            let slot = entry.slot_at(now);
            if let Some(last) = self.store.last_fired(entry.name()).await? {
                if last >= slot {
                    debug!(task = entry.name(), slot, "Slot already fired");
                    continue;
                }
            }
            let task = TaskEnvelope::new(
                entry.kind.clone(),
                entry.idempotency_key(slot),
                self.max_retries,
            );
            self.queue.enqueue(&task).await?;
            if !self.store.try_claim(entry.name(), slot).await? {
                warn!(task = entry.name(), slot, "Slot claimed by another scheduler");
            }
            info!(task = entry.name(), slot, task_id = %task.id, "Enqueued recurring task");
            enqueued += 1;
        }
        Ok(enqueued)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            entries = self.entries.len(),
            tick_secs = self.tick.as_secs(),
            "Starting scheduler"
        );
        for entry in &self.entries {
            match self.store.last_fired(entry.name()).await {
                Ok(last) => info!(
                    task = entry.name(),
                    interval_secs = entry.interval.as_secs(),
                    last_fired = ?last,
                    "Loaded schedule entry"
                ),
                Err(e) => error!(task = entry.name(), error = %e, "Failed to read last fired slot"),
            }
        }
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_at(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::jobs::queue::{InMemoryTaskQueue, Reservation};
    use crate::jobs::task::DeadLetter;
    use chrono::TimeZone;

    fn cleanup() -> RecurringTask {
        RecurringTask::new(
            TaskKind::CleanupOldData { retention_days: 90 },
            Duration::from_secs(3600),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn scheduler(store: Arc<dyn ScheduleStore>, queue: Arc<InMemoryTaskQueue>) -> Scheduler {
        Scheduler::new(store, queue, vec![cleanup()], Duration::from_secs(10), 3)
    }

    #[test]
    fn test_slot_floors_to_interval() {
        let entry = cleanup();
        assert_eq!(entry.slot_at(at(7200)), 7200);
        assert_eq!(entry.slot_at(at(7200 + 3599)), 7200);
        assert_eq!(entry.slot_at(at(7200 + 3600)), 10800);
        assert_eq!(entry.idempotency_key(7200), "cleanup_old_data:7200");
    }

    #[tokio::test]
    async fn test_fires_once_per_slot() {
        let store: Arc<dyn ScheduleStore> = Arc::new(InMemoryScheduleStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let s = scheduler(Arc::clone(&store), Arc::clone(&queue));

        assert_eq!(s.tick_at(at(7200)).await.unwrap(), 1);
        assert_eq!(s.tick_at(at(7210)).await.unwrap(), 0);
        assert_eq!(s.tick_at(at(10800)).await.unwrap(), 1);
        assert_eq!(queue.ready_len().await, 2);
        assert_eq!(store.last_fired("cleanup_old_data").await.unwrap(), Some(10800));
    }

    #[tokio::test]
    async fn test_restart_does_not_double_enqueue() {
        let store: Arc<dyn ScheduleStore> = Arc::new(InMemoryScheduleStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());

        let before_restart = scheduler(Arc::clone(&store), Arc::clone(&queue));
        assert_eq!(before_restart.tick_at(at(7300)).await.unwrap(), 1);
        drop(before_restart);

        let after_restart = scheduler(Arc::clone(&store), Arc::clone(&queue));
        assert_eq!(after_restart.tick_at(at(7305)).await.unwrap(), 0);
        assert_eq!(queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_slot_cannot_be_reclaimed() {
        let store = InMemoryScheduleStore::new();
        assert!(store.try_claim("cleanup_old_data", 200).await.unwrap());
        assert!(!store.try_claim("cleanup_old_data", 100).await.unwrap());
        assert!(!store.try_claim("cleanup_old_data", 200).await.unwrap());
        assert!(store.try_claim("cleanup_old_data", 300).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store: Arc<dyn ScheduleStore> = Arc::new(InMemoryScheduleStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let s = scheduler(store, Arc::clone(&queue));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { s.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.ready_len().await, 1);
    }

    /// Fails the first enqueue, then behaves like the in-memory queue.
    struct FirstEnqueueFails {
        inner: InMemoryTaskQueue,
        failed: AtomicBool,
    }

    #[async_trait]
    impl TaskQueue for FirstEnqueueFails {
        async fn enqueue(&self, task: &TaskEnvelope) -> Result<(), QueueError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(QueueError::Redis(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection reset",
                ))));
            }
            self.inner.enqueue(task).await
        }

        async fn reserve(&self, timeout: Duration) -> Result<Option<Reservation>, QueueError> {
            self.inner.reserve(timeout).await
        }

        async fn ack(&self, reservation: &Reservation) -> Result<(), QueueError> {
            self.inner.ack(reservation).await
        }

        async fn retry(
            &self,
            reservation: &Reservation,
            task: &TaskEnvelope,
            delay: Duration,
        ) -> Result<(), QueueError> {
            self.inner.retry(reservation, task, delay).await
        }

        async fn dead_letter(
            &self,
            reservation: &Reservation,
            letter: &DeadLetter,
        ) -> Result<(), QueueError> {
            self.inner.dead_letter(reservation, letter).await
        }

        async fn promote_due(&self) -> Result<usize, QueueError> {
            self.inner.promote_due().await
        }

        async fn recover_in_flight(&self) -> Result<usize, QueueError> {
            self.inner.recover_in_flight().await
        }

        async fn dead_letter_count(&self) -> Result<u64, QueueError> {
            self.inner.dead_letter_count().await
        }

        async fn dead_letters(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetter>, QueueError> {
            self.inner.dead_letters(offset, limit).await
        }

        async fn ping(&self) -> Result<(), QueueError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_failed_enqueue_is_retried_within_the_slot() {
        let store: Arc<dyn ScheduleStore> = Arc::new(InMemoryScheduleStore::new());
        let queue = Arc::new(FirstEnqueueFails {
            inner: InMemoryTaskQueue::new(),
            failed: AtomicBool::new(false),
        });
        let daily = RecurringTask::new(
            TaskKind::CleanupOldData { retention_days: 90 },
            Duration::from_secs(86_400),
        );
        let s = Scheduler::new(
            Arc::clone(&store),
            queue.clone(),
            vec![daily],
            Duration::from_secs(10),
            3,
        );

        assert!(s.tick_at(at(86_400 + 5)).await.is_err());
        assert_eq!(store.last_fired("cleanup_old_data").await.unwrap(), None);

        assert_eq!(s.tick_at(at(86_400 + 15)).await.unwrap(), 1);
        assert_eq!(queue.inner.ready_len().await, 1);
        assert_eq!(store.last_fired("cleanup_old_data").await.unwrap(), Some(86_400));
        assert_eq!(s.tick_at(at(86_400 + 25)).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "needs a running Redis at REDIS_URL"]
    async fn test_redis_claim_only_moves_forward() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url).unwrap();
        let prefix = format!("cvimprover:test:{}", uuid::Uuid::new_v4());
        let store = RedisScheduleStore::connect(&client, &prefix).await.unwrap();

        assert_eq!(store.last_fired("cleanup_old_data").await.unwrap(), None);
        assert!(store.try_claim("cleanup_old_data", 200).await.unwrap());
        assert!(!store.try_claim("cleanup_old_data", 200).await.unwrap());
        assert!(!store.try_claim("cleanup_old_data", 100).await.unwrap());
        assert!(store.try_claim("cleanup_old_data", 300).await.unwrap());
        assert_eq!(store.last_fired("cleanup_old_data").await.unwrap(), Some(300));
    }
}
