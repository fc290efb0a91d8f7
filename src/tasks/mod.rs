//! Persistent background work: the queue, its workers, and the scheduler.

pub mod queue;
pub mod scheduler;
pub mod worker;

pub use queue::{RetryPolicy, TaskKind, TaskPayload, TaskQueue};
pub use scheduler::{spawn_scheduler, ScheduleSettings};
pub use worker::{process_next_task, TaskContext, WorkerPool, WorkerSettings};
