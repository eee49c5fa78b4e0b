//! `QueueManager`: the public facade over stores, handlers and the pool.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use taskflow_core::{Payload, SharedClock, SystemClock, TaskId};
use taskflow_ratelimit::RateLimitPolicy;

use crate::error::QueueError;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::priority_queue::{InMemoryPriorityQueue, PriorityQueueStore};
use crate::stats::{InMemoryStatsStore, QueueStats, StatsStore};
use crate::store::{InMemoryTaskStore, TaskStore, Update};
use crate::types::{BackoffPolicy, DEFAULT_MAX_RETRIES, TaskPriority, TaskRecord, TaskStatus};
use crate::worker::{Executor, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};

/// How long finished records are kept by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The three stores a queue runs on. All in-process or all shared.
#[derive(Clone)]
pub struct QueueBackends {
    pub tasks: Arc<dyn TaskStore>,
    pub queue: Arc<dyn PriorityQueueStore>,
    pub stats: Arc<dyn StatsStore>,
}

impl QueueBackends {
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskStore::new()),
            queue: Arc::new(InMemoryPriorityQueue::new()),
            stats: Arc::new(InMemoryStatsStore::new()),
        }
    }
}

impl core::fmt::Debug for QueueBackends {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueBackends")
            .field("backend", &self.queue.backend_name())
            .finish_non_exhaustive()
    }
}

/// Queue-level configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// `max_retries` for tasks that do not set their own
    pub default_max_retries: u32,
    pub backoff: BackoffPolicy,
    pub pool: WorkerPoolConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

/// Submission builder.
#[derive(Debug, Clone)]
pub struct NewTask {
    task_type: String,
    payload: Payload,
    owner: Option<String>,
    priority: TaskPriority,
    max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: Payload::new(),
            owner: None,
            priority: TaskPriority::Normal,
            max_retries: None,
        }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Public entry point: submit, query, cancel, statistics, handler
/// registration and the worker pool lifecycle.
pub struct QueueManager {
    backends: QueueBackends,
    handlers: Arc<HandlerRegistry>,
    clock: SharedClock,
    config: QueueConfig,
    pool: Mutex<Option<WorkerPoolHandle>>,
}

impl core::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueManager")
            .field("backends", &self.backends)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    pub fn new(backends: QueueBackends, config: QueueConfig, clock: SharedClock) -> Self {
        Self {
            backends,
            handlers: Arc::new(HandlerRegistry::new()),
            clock,
            config,
            pool: Mutex::new(None),
        }
    }

    /// A single-process queue on the system clock.
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(QueueBackends::in_memory(), config, SystemClock::shared())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    fn pool(&self) -> MutexGuard<'_, Option<WorkerPoolHandle>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist and enqueue a task.
    ///
    /// Handler existence is not checked here; an unregistered type fails when
    /// a worker picks it up.
    pub fn submit(
        &self,
        task_type: impl Into<String>,
        payload: Payload,
        owner: Option<&str>,
        priority: TaskPriority,
    ) -> Result<TaskId, QueueError> {
        let mut task = NewTask::new(task_type).payload(payload).priority(priority);
        task.owner = owner.map(str::to_string);
        self.submit_task(task)
    }

    pub fn submit_task(&self, task: NewTask) -> Result<TaskId, QueueError> {
        let record = TaskRecord::new(
            task.task_type,
            task.payload,
            task.owner,
            task.priority,
            self.clock.now(),
        )
        .with_max_retries(task.max_retries.unwrap_or(self.config.default_max_retries));

        self.backends.tasks.insert(&record)?;
        self.backends.queue.push(record.priority, record.id)?;

        info!(
            task_id = %record.id,
            task_type = %record.task_type,
            priority = %record.priority,
            "task submitted"
        );
        Ok(record.id)
    }

    pub fn get_status(&self, id: TaskId) -> Result<TaskRecord, QueueError> {
        self.backends
            .tasks
            .get(id)?
            .ok_or(QueueError::TaskNotFound(id))
    }

    /// Cancel a PENDING task. `false` for any other state or unknown id; the
    /// record is left untouched in that case.
    pub fn cancel(&self, id: TaskId) -> Result<bool, QueueError> {
        let now = self.clock.now();
        match self.backends.tasks.update(id, &mut |t| t.cancel(now).is_ok())? {
            Update::Applied(record) => {
                if let Err(e) = self.backends.queue.remove(record.priority, id) {
                    // Workers skip cancelled ids, so a stale entry is harmless.
                    warn!(task_id = %id, error = %e, "cancelled task could not be removed from its bucket");
                }
                info!(task_id = %id, "task cancelled");
                Ok(true)
            }
            Update::Rejected(record) => {
                debug!(task_id = %id, status = %record.status, "cancel rejected");
                Ok(false)
            }
            Update::Missing => Ok(false),
        }
    }

    pub fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let depths = self.backends.queue.depths()?;
        let scheduled = self.backends.queue.scheduled_len()?;
        let counters = self.backends.stats.counters()?;
        let workers = self
            .pool()
            .as_ref()
            .filter(|h| h.is_running())
            .map(WorkerPoolHandle::info);

        Ok(QueueStats::new(
            self.backends.queue.backend_name(),
            depths,
            scheduled,
            counters,
            workers,
        ))
    }

    pub fn register_handler<H>(&self, task_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.handlers.register(task_type, handler);
    }

    /// Register a handler whose tasks are admitted through `scope` of the
    /// rate-limit policy given to [`QueueManager::start_workers`].
    pub fn register_rate_limited_handler<H>(
        &self,
        task_type: impl Into<String>,
        scope: impl Into<String>,
        handler: H,
    ) where
        H: TaskHandler + 'static,
    {
        self.handlers.register_rate_limited(task_type, scope, handler);
    }

    /// `owner`'s tasks oldest first, optionally filtered by status.
    pub fn list_tasks(
        &self,
        owner: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let mut tasks = self.backends.tasks.list_by_owner(owner)?;
        if let Some(status) = status {
            tasks.retain(|t| t.status == status);
        }
        Ok(tasks)
    }

    /// Delete finished records older than `older_than`.
    pub fn purge_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let removed = self.backends.tasks.purge_finished(cutoff)?;
        if removed > 0 {
            info!(removed, %cutoff, "purged finished tasks");
        }
        Ok(removed)
    }

    /// An executor over this queue's stores and handlers.
    pub fn executor(&self, rate_limits: Option<Arc<RateLimitPolicy>>) -> Executor {
        let executor = Executor::new(
            self.backends.clone(),
            self.handlers.clone(),
            self.clock.clone(),
            self.config.backoff.clone(),
        )
        .with_error_delay(self.config.pool.poll_interval);

        match rate_limits {
            Some(policy) => executor.with_rate_limits(policy),
            None => executor,
        }
    }

    /// Spawn the worker pool.
    pub fn start_workers(&self, rate_limits: Option<Arc<RateLimitPolicy>>) -> Result<(), QueueError> {
        let mut pool = self.pool();
        if pool.as_ref().is_some_and(WorkerPoolHandle::is_running) {
            return Err(QueueError::AlreadyRunning);
        }
        let handle = WorkerPool::spawn(self.executor(rate_limits), self.config.pool.clone())?;
        *pool = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.pool().as_ref().is_some_and(WorkerPoolHandle::is_running)
    }

    /// Stop the worker pool, letting in-flight handlers finish. Idempotent.
    pub fn close(&self) {
        let handle = self.pool().take();
        if let Some(mut handle) = handle {
            handle.shutdown();
        }
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskflow_core::{Clock, ManualClock};

    use crate::handler::HandlerOutcome;

    fn manager(clock: &ManualClock) -> QueueManager {
        let config = QueueConfig {
            backoff: BackoffPolicy::immediate(),
            ..QueueConfig::default()
        };
        QueueManager::new(QueueBackends::in_memory(), config, Arc::new(clock.clone()))
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn submit_then_get_status() {
        let clock = ManualClock::at_millis(1_000);
        let queue = manager(&clock);

        let id = queue
            .submit("email", payload(json!({"to": "a@b.c"})), Some("alice"), TaskPriority::High)
            .unwrap();

        let record = queue.get_status(id).unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.priority, TaskPriority::High);
        assert_eq!(record.owner.as_deref(), Some("alice"));
        assert_eq!(record.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(record.created_at, clock.now());
    }

    #[test]
    fn unknown_task_is_not_found() {
        let clock = ManualClock::at_millis(0);
        let queue = manager(&clock);
        let id = TaskId::new();
        assert!(matches!(queue.get_status(id), Err(QueueError::TaskNotFound(missing)) if missing == id));
        assert!(!queue.cancel(id).unwrap());
    }

    #[test]
    fn stats_report_depths_per_priority() {
        let clock = ManualClock::at_millis(0);
        let queue = manager(&clock);
        queue.submit("a", Payload::new(), None, TaskPriority::Urgent).unwrap();
        queue.submit("a", Payload::new(), None, TaskPriority::Low).unwrap();
        queue.submit("a", Payload::new(), None, TaskPriority::Low).unwrap();

        let stats = queue.get_stats().unwrap();
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.queue_depths.urgent, 1);
        assert_eq!(stats.queue_depths.low, 2);
        assert_eq!(stats.queue_depths.total(), 3);
        assert_eq!(stats.total_processed, 0);
        assert!(stats.workers.is_none());
    }

    #[test]
    fn cancel_removes_task_from_its_bucket() {
        let clock = ManualClock::at_millis(0);
        let queue = manager(&clock);
        let id = queue.submit("a", Payload::new(), None, TaskPriority::Normal).unwrap();

        assert!(queue.cancel(id).unwrap());
        assert!(!queue.cancel(id).unwrap());
        assert_eq!(queue.get_status(id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(queue.get_stats().unwrap().queue_depths.total(), 0);
    }

    #[test]
    fn list_tasks_filters_by_owner_and_status() {
        let clock = ManualClock::at_millis(0);
        let queue = manager(&clock);
        queue.register_handler("ok", |_: &TaskRecord| HandlerOutcome::success(Payload::new()));

        let first = queue.submit("ok", Payload::new(), Some("alice"), TaskPriority::Normal).unwrap();
        clock.advance(Duration::from_millis(1));
        let second = queue.submit("ok", Payload::new(), Some("alice"), TaskPriority::Low).unwrap();
        queue.submit("ok", Payload::new(), Some("bob"), TaskPriority::Normal).unwrap();
        queue.cancel(second).unwrap();

        let all: Vec<_> = queue.list_tasks("alice", None).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(all, vec![first, second]);

        let cancelled = queue.list_tasks("alice", Some(TaskStatus::Cancelled)).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, second);
    }

    #[test]
    fn purge_keeps_recent_and_unfinished_tasks() {
        let clock = ManualClock::at_millis(0);
        let queue = manager(&clock);
        let old = queue.submit("a", Payload::new(), None, TaskPriority::Normal).unwrap();
        let pending = queue.submit("a", Payload::new(), None, TaskPriority::Normal).unwrap();
        queue.cancel(old).unwrap();

        clock.advance(DEFAULT_RETENTION + Duration::from_secs(1));
        let recent = queue.submit("a", Payload::new(), None, TaskPriority::Normal).unwrap();
        queue.cancel(recent).unwrap();

        assert_eq!(queue.purge_finished(DEFAULT_RETENTION).unwrap(), 1);
        assert!(queue.get_status(old).is_err());
        assert!(queue.get_status(pending).is_ok());
        assert!(queue.get_status(recent).is_ok());
    }

    #[test]
    fn workers_start_once_and_close() {
        let clock = ManualClock::at_millis(0);
        let mut config = QueueConfig::default();
        config.pool = config.pool.with_units(1).with_poll_interval(Duration::from_millis(5));
        let queue = QueueManager::new(QueueBackends::in_memory(), config, Arc::new(clock));

        queue.start_workers(None).unwrap();
        assert!(queue.is_running());
        assert!(matches!(queue.start_workers(None), Err(QueueError::AlreadyRunning)));
        assert_eq!(queue.get_stats().unwrap().workers.map(|w| w.units), Some(1));

        queue.close();
        assert!(!queue.is_running());
        queue.close();
    }
}
