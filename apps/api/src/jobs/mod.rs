//! Background task topology.
//!
//! The api enqueues, the worker executes and the scheduler enqueues recurring
//! work. All three share one queue backend; none of them runs another's job.

pub mod handlers;
pub mod idempotency;
pub mod queue;
pub mod redis_queue;
pub mod retry;
pub mod schedule;
pub mod task;
pub mod worker;

pub use handlers::{CvTaskHandler, TaskError, TaskHandler};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore};
pub use queue::{DeadLetterPages, InMemoryTaskQueue, QueueError, Reservation, TaskQueue};
pub use redis_queue::{RedisTaskQueue, DEFAULT_PREFIX};
pub use retry::RetryPolicy;
pub use schedule::{InMemoryScheduleStore, RecurringTask, RedisScheduleStore, ScheduleStore, Scheduler};
pub use task::{DeadLetter, TaskEnvelope, TaskKind};
pub use worker::{Outcome, Worker, WorkerSettings};
