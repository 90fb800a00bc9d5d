//! The worker loop: reserve, run under a bounded number of slots, settle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::handlers::TaskHandler;
use super::idempotency::IdempotencyStore;
use super::queue::{QueueError, Reservation, TaskQueue};
use super::retry::RetryPolicy;
use super::task::DeadLetter;

const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Fixed number of tasks executing at once.
    pub concurrency: usize,
    /// How long one `reserve` call may block. Bounds shutdown latency.
    pub reserve_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            reserve_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a single delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The idempotency key was already completed; the handler did not run.
    Duplicate,
    Retried,
    DeadLettered,
}

pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    idempotency: Arc<dyn IdempotencyStore>,
    settings: WorkerSettings,
    slots: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        idempotency: Arc<dyn IdempotencyStore>,
        settings: WorkerSettings,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            queue,
            handler,
            idempotency,
            settings: WorkerSettings {
                concurrency,
                ..settings
            },
            slots: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Runs until `shutdown` flips to true, then waits for in-flight tasks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        info!(
            concurrency = self.settings.concurrency,
            max_retries = self.settings.retry.max_retries,
            "Starting worker"
        );

        let recovered = self.queue.recover_in_flight().await?;
        if recovered > 0 {
            warn!(recovered, "Requeued tasks left in flight by a previous run");
        }

        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = self.queue.promote_due().await {
                debug!(error = %e, "Failed to promote delayed retries");
            }

            match self.queue.reserve(self.settings.reserve_timeout).await {
                Ok(Some(reservation)) => {
                    consecutive_errors = 0;
                    self.spawn(reservation, permit);
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(QueueError::Malformed(_)) => {}
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Queue backend error, backing off"
                    );
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("Shutdown requested, waiting for in-flight tasks");
        let all = u32::try_from(self.settings.concurrency).unwrap_or(u32::MAX);
        let _drained = self.slots.acquire_many(all).await;
        info!("Worker stopped");
        Ok(())
    }

    /// Reserves and executes one task inline. Returns `None` if nothing was ready.
    pub async fn process_next(&self) -> Result<Option<Outcome>, QueueError> {
        self.queue.promote_due().await?;
        match self.queue.reserve(self.settings.reserve_timeout).await? {
            Some(reservation) => Ok(Some(self.execute(reservation).await)),
            None => Ok(None),
        }
    }

    fn spawn(&self, reservation: Reservation, permit: OwnedSemaphorePermit) {
        let worker = self.detached();
        tokio::spawn(async move {
            worker.execute(reservation).await;
            drop(permit);
        });
    }

    fn detached(&self) -> Worker {
        Worker {
            queue: Arc::clone(&self.queue),
            handler: Arc::clone(&self.handler),
            idempotency: Arc::clone(&self.idempotency),
            settings: self.settings,
            slots: Arc::clone(&self.slots),
        }
    }

    async fn execute(&self, reservation: Reservation) -> Outcome {
        let task = &reservation.task;
        let key = task.idempotency_key.as_str();

        match self.idempotency.is_completed(key).await {
            Ok(true) => {
                info!(task_id = %task.id, task = task.name(), key, "Skipping already completed task");
                self.settle(self.queue.ack(&reservation).await, "ack");
                return Outcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, key, "Idempotency lookup failed, running handler anyway"),
        }

        debug!(task_id = %task.id, task = task.name(), attempt = task.attempt, "Running task");

        match self.handler.handle(task).await {
            Ok(()) => {
                self.settle(self.idempotency.mark_completed(key).await, "mark completed");
                self.settle(self.queue.ack(&reservation).await, "ack");
                info!(task_id = %task.id, task = task.name(), "Task completed");
                Outcome::Completed
            }
            Err(e) if e.is_retryable() && !task.retries_exhausted() => {
                let delay = self.settings.retry.delay_for(task.attempt);
                let next = task.next_attempt(&e.to_string());
                warn!(
                    task_id = %task.id,
                    task = task.name(),
                    attempt = next.attempt,
                    max_retries = task.max_retries,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Task failed, scheduling retry"
                );
                self.settle(self.queue.retry(&reservation, &next, delay).await, "retry");
                Outcome::Retried
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    task = task.name(),
                    attempt = task.attempt,
                    error = %e,
                    "Task failed permanently, moving to dead letters"
                );
                let letter = DeadLetter::new(task.clone(), e.to_string());
                self.settle(
                    self.queue.dead_letter(&reservation, &letter).await,
                    "dead letter",
                );
                Outcome::DeadLettered
            }
        }
    }

    /// Failures here leave the task in flight; recovery on restart redelivers it.
    fn settle(&self, result: Result<(), QueueError>, step: &str) {
        if let Err(e) = result {
            error!(error = %e, step, "Failed to settle task with the queue backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handlers::TaskError;
    use crate::jobs::idempotency::InMemoryIdempotencyStore;
    use crate::jobs::queue::InMemoryTaskQueue;
    use crate::jobs::task::{TaskEnvelope, TaskKind};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Counts runs and distinct side effects; fails the first `fail_first` runs.
    #[derive(Default)]
    struct RecordingHandler {
        runs: AtomicUsize,
        fail_first: usize,
        permanent: bool,
        effects: Mutex<HashSet<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, task: &TaskEnvelope) -> Result<(), TaskError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.hold.is_zero() {
                tokio::time::sleep(self.hold).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if run < self.fail_first {
                return Err(if self.permanent {
                    TaskError::Permanent("bad payload".to_string())
                } else {
                    TaskError::Retryable("provider timeout".to_string())
                });
            }
            self.effects
                .lock()
                .await
                .insert(task.idempotency_key.clone());
            Ok(())
        }
    }

    fn task(key: &str, max_retries: u32) -> TaskEnvelope {
        TaskEnvelope::new(TaskKind::CleanupOldData { retention_days: 90 }, key, max_retries)
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            concurrency: 2,
            reserve_timeout: Duration::from_millis(10),
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
            },
        }
    }

    fn worker(queue: &Arc<InMemoryTaskQueue>, handler: &Arc<RecordingHandler>) -> Worker {
        Worker::new(
            Arc::clone(queue) as Arc<dyn TaskQueue>,
            Arc::clone(handler) as Arc<dyn TaskHandler>,
            Arc::new(InMemoryIdempotencyStore::new()),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_success_acks_task() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(RecordingHandler::default());
        let w = worker(&queue, &handler);

        queue.enqueue(&task("k1", 3)).await.unwrap();
        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::Completed));
        assert_eq!(queue.in_flight_len().await, 0);
        assert_eq!(w.process_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_idempotency_key_has_one_side_effect() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(RecordingHandler::default());
        let w = worker(&queue, &handler);

        // A scheduler restart enqueues the same slot twice.
        queue.enqueue(&task("cleanup_old_data:3600", 3)).await.unwrap();
        queue.enqueue(&task("cleanup_old_data:3600", 3)).await.unwrap();

        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::Completed));
        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::Duplicate));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(handler.effects.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_retried_with_backoff() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(RecordingHandler {
            fail_first: 1,
            ..Default::default()
        });
        let w = worker(&queue, &handler);

        queue.enqueue(&task("flaky", 3)).await.unwrap();
        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::Retried));
        assert_eq!(queue.delayed_len().await, 1);
        assert_eq!(w.process_next().await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::Completed));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_dead_lettered() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(RecordingHandler {
            fail_first: usize::MAX,
            ..Default::default()
        });
        let w = worker(&queue, &handler);

        queue.enqueue(&task("doomed", 1)).await.unwrap();
        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::Retried));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::DeadLettered));

        let dead = queue.dead_letters(0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task.attempt, 1);
        assert!(dead[0].error.contains("provider timeout"));
        assert_eq!(queue.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(RecordingHandler {
            fail_first: 1,
            permanent: true,
            ..Default::default()
        });
        let w = worker(&queue, &handler);

        queue.enqueue(&task("broken", 3)).await.unwrap();
        assert_eq!(w.process_next().await.unwrap(), Some(Outcome::DeadLettered));
        assert_eq!(queue.dead_letter_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_respects_concurrency_and_drains_on_shutdown() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(RecordingHandler {
            hold: Duration::from_millis(30),
            ..Default::default()
        });
        let w = worker(&queue, &handler);

        for i in 0..6 {
            queue.enqueue(&task(&format!("k{i}"), 3)).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(handler.effects.lock().await.len(), 6);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn test_run_recovers_tasks_left_in_flight() {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let handler = Arc::new(RecordingHandler::default());

        queue.enqueue(&task("orphan", 3)).await.unwrap();
        let orphaned = queue.reserve(Duration::from_millis(10)).await.unwrap();
        assert!(orphaned.is_some());

        let w = worker(&queue, &handler);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { w.run(rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(handler.effects.lock().await.contains("orphan"));
    }
}
