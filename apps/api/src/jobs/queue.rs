//! The task queue seam shared by the api, worker and scheduler processes.
//!
//! Delivery is at-least-once: `reserve` moves a task into an in-flight list
//! and only `ack`, `retry` or `dead_letter` take it out again. Whatever is
//! still in flight when a worker dies is put back by `recover_in_flight`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::error;

use super::task::{DeadLetter, TaskEnvelope};
use crate::pagination::PageSource;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Task serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Discarded malformed task payload: {0}")]
    Malformed(String),
}

/// A task handed to one worker. `receipt` is the raw entry held in flight.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub task: TaskEnvelope,
    pub receipt: String,
}

impl Reservation {
    pub(crate) fn decode(raw: String) -> Result<Self, serde_json::Error> {
        let task = serde_json::from_str(&raw)?;
        Ok(Self { task, receipt: raw })
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &TaskEnvelope) -> Result<(), QueueError>;

    /// Waits up to `timeout` for a ready task and marks it in flight.
    async fn reserve(&self, timeout: Duration) -> Result<Option<Reservation>, QueueError>;

    /// Drops a finished task from the in-flight list.
    async fn ack(&self, reservation: &Reservation) -> Result<(), QueueError>;

    /// Replaces an in-flight task with `task`, deliverable after `delay`.
    async fn retry(
        &self,
        reservation: &Reservation,
        task: &TaskEnvelope,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Moves an in-flight task to the dead-letter list.
    async fn dead_letter(
        &self,
        reservation: &Reservation,
        letter: &DeadLetter,
    ) -> Result<(), QueueError>;

    /// Makes delayed retries whose delay has elapsed deliverable. Returns how many moved.
    async fn promote_due(&self) -> Result<usize, QueueError>;

    /// Puts tasks left in flight by a previous run back on the ready list.
    async fn recover_in_flight(&self) -> Result<usize, QueueError>;

    async fn dead_letter_count(&self) -> Result<u64, QueueError>;

    /// Dead letters, newest first.
    async fn dead_letters(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetter>, QueueError>;

    /// Checks that the backend answers.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Paginates the dead-letter list of a queue.
pub struct DeadLetterPages {
    queue: Arc<dyn TaskQueue>,
}

impl DeadLetterPages {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl PageSource for DeadLetterPages {
    type Item = DeadLetter;
    type Error = QueueError;

    async fn count(&self) -> Result<u64, QueueError> {
        self.queue.dead_letter_count().await
    }

    async fn slice(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetter>, QueueError> {
        self.queue.dead_letters(offset, limit).await
    }
}

#[derive(Default)]
struct MemoryState {
    ready: VecDeque<String>,
    in_flight: Vec<String>,
    delayed: Vec<(Instant, String)>,
    dead: VecDeque<String>,
}

impl MemoryState {
    fn take_in_flight(&mut self, receipt: &str) {
        if let Some(pos) = self.in_flight.iter().position(|r| r == receipt) {
            self.in_flight.remove(pos);
        }
    }
}

/// Process-local queue with the same delivery semantics as the Redis one.
/// Used by tests and single-process development setups.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: &TaskEnvelope) -> Result<(), QueueError> {
        let raw = serde_json::to_string(task)?;
        self.state.lock().await.ready.push_front(raw);
        self.notify.notify_one();
        Ok(())
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Reservation>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(raw) = state.ready.pop_back() {
                    return match Reservation::decode(raw.clone()) {
                        Ok(reservation) => {
                            state.in_flight.push(raw);
                            Ok(Some(reservation))
                        }
                        Err(e) => {
                            error!(error = %e, "Discarding malformed task payload");
                            Err(QueueError::Malformed(e.to_string()))
                        }
                    };
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, reservation: &Reservation) -> Result<(), QueueError> {
        self.state.lock().await.take_in_flight(&reservation.receipt);
        Ok(())
    }

    async fn retry(
        &self,
        reservation: &Reservation,
        task: &TaskEnvelope,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_string(task)?;
        let mut state = self.state.lock().await;
        state.take_in_flight(&reservation.receipt);
        state.delayed.push((Instant::now() + delay, raw));
        Ok(())
    }

    async fn dead_letter(
        &self,
        reservation: &Reservation,
        letter: &DeadLetter,
    ) -> Result<(), QueueError> {
        let raw = serde_json::to_string(letter)?;
        let mut state = self.state.lock().await;
        state.take_in_flight(&reservation.receipt);
        state.dead.push_front(raw);
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(ready_at, _)| *ready_at <= now);
        state.delayed = waiting;
        let moved = due.len();
        for (_, raw) in due {
            state.ready.push_front(raw);
        }
        drop(state);
        if moved > 0 {
            self.notify.notify_one();
        }
        Ok(moved)
    }

    async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let recovered = std::mem::take(&mut state.in_flight);
        let count = recovered.len();
        for raw in recovered {
            state.ready.push_back(raw);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_one();
        }
        Ok(count)
    }

    async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.dead.len() as u64)
    }

    async fn dead_letters(&self, offset: u64, limit: u64) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().await;
        state
            .dead
            .iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|raw| serde_json::from_str(raw).map_err(QueueError::from))
            .collect()
    }
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::task::TaskKind;
    use uuid::Uuid;

    fn task(key: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskKind::GenerateAiResponse {
                questionnaire_id: Uuid::new_v4(),
            },
            key,
            3,
        )
    }

    const WAIT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_reserve_is_fifo_and_tracks_in_flight() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(&task("a")).await.unwrap();
        queue.enqueue(&task("b")).await.unwrap();

        let first = queue.reserve(WAIT).await.unwrap().unwrap();
        assert_eq!(first.task.idempotency_key, "a");
        assert_eq!(queue.in_flight_len().await, 1);
        assert_eq!(queue.ready_len().await, 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn test_reserve_times_out_on_empty_queue() {
        let queue = InMemoryTaskQueue::new();
        assert!(queue.reserve(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.reserve(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(&task("late")).await.unwrap();
        let reserved = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(reserved.task.idempotency_key, "late");
    }

    #[tokio::test]
    async fn test_unacked_task_is_recovered_after_crash() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(&task("crashy")).await.unwrap();
        let reserved = queue.reserve(WAIT).await.unwrap().unwrap();
        drop(reserved);

        assert!(queue.reserve(WAIT).await.unwrap().is_none());
        assert_eq!(queue.recover_in_flight().await.unwrap(), 1);

        let again = queue.reserve(WAIT).await.unwrap().unwrap();
        assert_eq!(again.task.idempotency_key, "crashy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_delayed_until_promoted() {
        let queue = InMemoryTaskQueue::new();
        queue.enqueue(&task("flaky")).await.unwrap();
        let reserved = queue.reserve(WAIT).await.unwrap().unwrap();

        let next = reserved.task.next_attempt("boom");
        queue
            .retry(&reserved, &next, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(queue.in_flight_len().await, 0);
        assert_eq!(queue.promote_due().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.promote_due().await.unwrap(), 1);

        let again = queue.reserve(WAIT).await.unwrap().unwrap();
        assert_eq!(again.task.attempt, 1);
        assert_eq!(again.task.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_dead_letters_are_paginated_newest_first() {
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
        for key in ["one", "two", "three"] {
            queue.enqueue(&task(key)).await.unwrap();
            let reserved = queue.reserve(WAIT).await.unwrap().unwrap();
            let letter = DeadLetter::new(reserved.task.clone(), "fatal");
            queue.dead_letter(&reserved, &letter).await.unwrap();
        }

        let pages = DeadLetterPages::new(Arc::clone(&queue));
        assert_eq!(pages.count().await.unwrap(), 3);
        let slice = pages.slice(1, 5).await.unwrap();
        let keys: Vec<_> = slice.iter().map(|d| d.task.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["two", "one"]);
    }
}
