//! Priority task queue with a retrying worker pool.
//!
//! ## Design
//!
//! - Four strict priority buckets, FIFO within a bucket
//! - Pop is atomic: two workers never receive the same task id
//! - Failed handlers are retried with backoff up to `max_retries`, then FAILED
//! - Missing handlers are permanent failures (no retry)
//! - Cancellation only while PENDING; running handlers are never interrupted
//!
//! ## Components
//!
//! - `TaskRecord`: the durable unit of work and its state machine
//! - `TaskStore`: record persistence with atomic read-modify-write
//! - `PriorityQueueStore`: priority buckets plus the delayed-retry set
//! - `StatsStore`: processed/failed/retried counters
//! - `WorkerPool`: N execution units running registered handlers
//! - `QueueManager`: the public facade (submit, status, cancel, stats)

pub mod error;
pub mod handler;
pub mod manager;
pub mod priority_queue;
pub mod stats;
pub mod store;
pub mod types;
pub mod worker;

pub use error::QueueError;
pub use handler::{HandlerOutcome, HandlerRegistry, TaskHandler};
pub use manager::{DEFAULT_RETENTION, NewTask, QueueBackends, QueueConfig, QueueManager};
pub use priority_queue::{InMemoryPriorityQueue, PriorityQueueStore, QueueDepths};
pub use stats::{InMemoryStatsStore, QueueStats, StatEvent, StatsCounters, StatsStore};
pub use store::{InMemoryTaskStore, StoreError, TaskStore, Update};
pub use types::{
    AttemptRecord, BackoffPolicy, DEFAULT_MAX_RETRIES, BackoffStrategy, TaskPriority, TaskRecord, TaskStatus,
    TransitionError,
};
pub use worker::{Executor, PoolInfo, Processed, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};

pub use taskflow_core::{Payload, TaskId};
