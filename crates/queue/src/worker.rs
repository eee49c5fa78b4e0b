//! Worker pool: execution units that pop, run and settle tasks.
//!
//! Each unit loops `pop -> resolve handler -> claim -> execute -> write back`.
//! A separate scheduler unit moves due retries from the delayed set back into
//! their priority bucket. Handlers run outside every store lock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use taskflow_core::{Payload, SharedClock, TaskId};
use taskflow_ratelimit::{RateLimitPolicy, Subject};

use crate::error::QueueError;
use crate::handler::{HandlerOutcome, HandlerRegistry};
use crate::manager::QueueBackends;
use crate::stats::StatEvent;
use crate::store::Update;
use crate::types::{BackoffPolicy, TaskPriority, TaskRecord};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent execution units
    pub units: usize,
    /// Idle sleep when the queue is empty
    pub poll_interval: Duration,
    /// Name prefix for threads and logs
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            units: 4,
            poll_interval: Duration::from_millis(100),
            name: "taskflow-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_units(mut self, units: usize) -> Self {
        self.units = units.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What one [`Executor::run_once`] call did with the task it popped.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Completed(TaskId),
    /// Handler failed; parked until `retry_at`.
    Retrying {
        id: TaskId,
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    /// Retries exhausted or no handler registered.
    Failed(TaskId),
    /// The task's rate-limit scope denied the owner; rescheduled without
    /// consuming a retry.
    Throttled { id: TaskId, retry_after: Duration },
    /// Popped id was cancelled, already settled or unknown.
    Skipped(TaskId),
}

impl Processed {
    pub fn task_id(&self) -> TaskId {
        match self {
            Processed::Completed(id)
            | Processed::Failed(id)
            | Processed::Skipped(id)
            | Processed::Retrying { id, .. }
            | Processed::Throttled { id, .. } => *id,
        }
    }
}

/// Live pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub units: usize,
    pub busy_units: usize,
    pub uptime_secs: u64,
}

/// Executes one task at a time against the shared stores.
///
/// Cheap to clone; every execution unit holds its own clone.
#[derive(Clone)]
pub struct Executor {
    backends: QueueBackends,
    handlers: Arc<HandlerRegistry>,
    rate_limits: Option<Arc<RateLimitPolicy>>,
    clock: SharedClock,
    backoff: BackoffPolicy,
    error_delay: Duration,
    busy: Arc<AtomicUsize>,
}

impl core::fmt::Debug for Executor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backends.queue.backend_name())
            .field("backoff", &self.backoff)
            .field("rate_limited", &self.rate_limits.is_some())
            .finish_non_exhaustive()
    }
}

struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Executor {
    pub fn new(
        backends: QueueBackends,
        handlers: Arc<HandlerRegistry>,
        clock: SharedClock,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            backends,
            handlers,
            rate_limits: None,
            clock,
            backoff,
            error_delay: Duration::from_millis(100),
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Gate rate-limited task types through `policy`.
    pub fn with_rate_limits(mut self, policy: Arc<RateLimitPolicy>) -> Self {
        self.rate_limits = Some(policy);
        self
    }

    /// How long a task is parked when its rate-limit check itself fails.
    pub fn with_error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = delay;
        self
    }

    /// Units currently executing a handler.
    pub fn busy_units(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Pop and settle at most one task.
    ///
    /// Returns `Ok(None)` when every bucket is empty. Handler failures and
    /// panics become task state; only store and rate-limit errors are
    /// returned. A task interrupted by an error is put back in its bucket,
    /// or parked when its rate-limit check failed.
    pub fn run_once(&self) -> Result<Option<Processed>, QueueError> {
        let Some((priority, id)) = self.backends.queue.pop()? else {
            return Ok(None);
        };

        match self.process(id) {
            Ok(processed) => Ok(Some(processed)),
            // A failed rate-limit check has already parked the task.
            Err(e @ QueueError::RateLimit(_)) => Err(e),
            Err(e) => {
                self.requeue_after_error(priority, id, &e);
                Err(e)
            }
        }
    }

    /// Counters are advisory; a failed write is logged and the task outcome
    /// stands.
    fn record_stat(&self, event: StatEvent) {
        if let Err(e) = self.backends.stats.record(event) {
            warn!(error = %e, ?event, "failed to record task statistics");
        }
    }

    /// Put a popped id back into its bucket after processing was cut short.
    ///
    /// Ids whose record has since left a claimable state are skipped when
    /// popped again.
    fn requeue_after_error(&self, priority: TaskPriority, id: TaskId, cause: &QueueError) {
        match self.backends.queue.push(priority, id) {
            Ok(()) => warn!(task_id = %id, error = %cause, "task requeued after error"),
            Err(e) => error!(
                task_id = %id,
                error = %cause,
                requeue_error = %e,
                "task could not be requeued after error"
            ),
        }
    }

    fn process(&self, id: TaskId) -> Result<Processed, QueueError> {
        let Some(task) = self.backends.tasks.get(id)? else {
            warn!(task_id = %id, "dequeued task has no record; dropping");
            return Ok(Processed::Skipped(id));
        };

        if !task.status.is_claimable() {
            debug!(task_id = %id, status = %task.status, "skipping task that is no longer claimable");
            return Ok(Processed::Skipped(id));
        }

        let Some(registration) = self.handlers.resolve(&task.task_type) else {
            return self.fail_unregistered(&task);
        };

        if let Some(scope) = registration.rate_limit_scope.as_deref() {
            if let Some(throttled) = self.admit(&task, scope)? {
                return Ok(throttled);
            }
        }

        let started = self.clock.now();
        let claimed = match self.backends.tasks.update(id, &mut |t| t.claim(started).is_ok())? {
            Update::Applied(record) => record,
            Update::Rejected(record) => {
                debug!(task_id = %id, status = %record.status, "lost claim race");
                return Ok(Processed::Skipped(id));
            }
            Update::Missing => return Ok(Processed::Skipped(id)),
        };

        info!(
            task_id = %id,
            task_type = %claimed.task_type,
            priority = %claimed.priority,
            attempt = claimed.retry_count + 1,
            "processing task"
        );

        let outcome = {
            let _busy = BusyGuard::enter(&self.busy);
            let timer = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                registration.handler.execute(&claimed)
            }))
            .unwrap_or_else(|panic| HandlerOutcome::Failure(panic_message(panic.as_ref())));
            (outcome, timer.elapsed())
        };

        match outcome {
            (HandlerOutcome::Success(result), elapsed) => {
                self.settle_success(&claimed, result, started, elapsed)
            }
            (HandlerOutcome::Failure(error), elapsed) => {
                self.settle_failure(&claimed, error, started, elapsed)
            }
        }
    }

    /// Move due retries back into their priority buckets.
    pub fn promote_due(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let ids = self.backends.queue.promote_due(now)?;
        for id in &ids {
            // Throttled tasks are still PENDING and cancelled ones are
            // terminal; both are left as they are.
            if let Update::Applied(record) = self.backends.tasks.update(*id, &mut |t| t.requeue().is_ok())? {
                debug!(
                    task_id = %id,
                    priority = %record.priority,
                    retry_count = record.retry_count,
                    "retry requeued"
                );
            }
        }
        Ok(ids.len())
    }

    /// Process until every bucket is empty, promoting due retries between
    /// tasks. Tasks parked in the future are left parked.
    pub fn drain(&self) -> Result<Vec<Processed>, QueueError> {
        let mut processed = Vec::new();
        loop {
            self.promote_due()?;
            match self.run_once()? {
                Some(p) => processed.push(p),
                None => return Ok(processed),
            }
        }
    }

    fn fail_unregistered(&self, task: &TaskRecord) -> Result<Processed, QueueError> {
        let error = format!("no handler registered for task type: {}", task.task_type);
        let now = self.clock.now();
        let applied = self.backends.tasks.update(task.id, &mut |t| {
            t.claim(now).is_ok() && t.fail(error.clone(), now, now).is_ok()
        })?;

        match applied {
            Update::Applied(_) => {
                warn!(task_id = %task.id, task_type = %task.task_type, "task failed permanently: no handler");
                self.record_stat(StatEvent::Failed { elapsed: None });
                Ok(Processed::Failed(task.id))
            }
            _ => Ok(Processed::Skipped(task.id)),
        }
    }

    /// Check the owner against `scope`. `Some` when the task was parked.
    fn admit(&self, task: &TaskRecord, scope: &str) -> Result<Option<Processed>, QueueError> {
        let Some(policy) = &self.rate_limits else {
            return Ok(None);
        };

        let subject = task
            .owner
            .as_deref()
            .map_or_else(Subject::anonymous, Subject::user);

        let decision = match policy.check(&subject, &[scope]) {
            Ok(decision) => decision,
            Err(e) => {
                error!(task_id = %task.id, scope, error = %e, "rate limit check failed; parking task");
                let due = after(self.clock.now(), self.error_delay);
                self.backends.queue.schedule(task.priority, task.id, due)?;
                return Err(e.into());
            }
        };

        if decision.allowed {
            return Ok(None);
        }

        let retry_after = decision.retry_after();
        let due = after(self.clock.now(), retry_after);
        self.backends.queue.schedule(task.priority, task.id, due)?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            scope,
            retry_after_ms = retry_after.as_millis() as u64,
            "task throttled"
        );
        Ok(Some(Processed::Throttled {
            id: task.id,
            retry_after,
        }))
    }

    fn settle_success(
        &self,
        task: &TaskRecord,
        result: Payload,
        started: DateTime<Utc>,
        elapsed: Duration,
    ) -> Result<Processed, QueueError> {
        let finished = self.clock.now();
        match self.backends.tasks.update(task.id, &mut |t| {
            t.complete(result.clone(), started, finished).is_ok()
        })? {
            Update::Applied(_) => {
                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "task completed"
                );
                self.record_stat(StatEvent::Completed { elapsed });
                Ok(Processed::Completed(task.id))
            }
            Update::Rejected(_) | Update::Missing => {
                warn!(task_id = %task.id, "task record changed while processing; result dropped");
                Ok(Processed::Skipped(task.id))
            }
        }
    }

    fn settle_failure(
        &self,
        task: &TaskRecord,
        error: String,
        started: DateTime<Utc>,
        elapsed: Duration,
    ) -> Result<Processed, QueueError> {
        let finished = self.clock.now();

        if !task.should_retry() {
            let applied = self.backends.tasks.update(task.id, &mut |t| {
                t.fail(error.clone(), started, finished).is_ok()
            })?;
            if !matches!(applied, Update::Applied(_)) {
                return Ok(Processed::Skipped(task.id));
            }
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                retry_count = task.retry_count,
                error = %error,
                "task failed after exhausting retries"
            );
            self.record_stat(StatEvent::Failed { elapsed: Some(elapsed) });
            return Ok(Processed::Failed(task.id));
        }

        let delay = self.backoff.delay_for_retry(task.retry_count + 1);
        let retry_at = after(finished, delay);
        let record = match self.backends.tasks.update(task.id, &mut |t| {
            t.schedule_retry(error.clone(), started, finished, retry_at).is_ok()
        })? {
            Update::Applied(record) => record,
            Update::Rejected(_) | Update::Missing => return Ok(Processed::Skipped(task.id)),
        };

        if let Err(e) = self.backends.queue.schedule(record.priority, record.id, retry_at) {
            // RETRYING is claimable, so an immediate push still retries the task.
            warn!(task_id = %task.id, error = %e, "could not park retry; requeueing now");
            self.backends.queue.push(record.priority, record.id)?;
        }
        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            retry_count = record.retry_count,
            max_retries = record.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "task failed; retry scheduled"
        );
        self.record_stat(StatEvent::Retried { elapsed });

        Ok(Processed::Retrying {
            id: task.id,
            retry_count: record.retry_count,
            retry_at,
        })
    }
}

/// Spawns execution units on dedicated threads.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Start `config.units` execution units plus one retry scheduler.
    pub fn spawn(executor: Executor, config: WorkerPoolConfig) -> Result<WorkerPoolHandle, QueueError> {
        let units = config.units.max(1);
        let mut handle = WorkerPoolHandle {
            shutdown: Arc::new(AtomicBool::new(false)),
            joins: Vec::with_capacity(units + 1),
            busy: executor.busy.clone(),
            units,
            started: Instant::now(),
            name: config.name.clone(),
        };

        for n in 0..units {
            let unit = format!("{}-{n}", config.name);
            let executor = executor.clone();
            let shutdown = handle.shutdown.clone();
            let poll = config.poll_interval;
            let spawned = thread::Builder::new()
                .name(unit.clone())
                .spawn(move || unit_loop(executor, unit, poll, shutdown));
            match spawned {
                Ok(join) => handle.joins.push(join),
                Err(e) => {
                    handle.shutdown();
                    return Err(QueueError::Spawn(e.to_string()));
                }
            }
        }

        let scheduler = format!("{}-scheduler", config.name);
        let shutdown = handle.shutdown.clone();
        let poll = config.poll_interval;
        let spawned = thread::Builder::new()
            .name(scheduler.clone())
            .spawn(move || scheduler_loop(executor, scheduler, poll, shutdown));
        match spawned {
            Ok(join) => handle.joins.push(join),
            Err(e) => {
                handle.shutdown();
                return Err(QueueError::Spawn(e.to_string()));
            }
        }

        info!(pool = %config.name, units, "worker pool started");
        Ok(handle)
    }
}

fn unit_loop(executor: Executor, unit: String, poll: Duration, shutdown: Arc<AtomicBool>) {
    info!(worker = %unit, "worker unit started");

    while !shutdown.load(Ordering::Acquire) {
        match executor.run_once() {
            Ok(Some(processed)) => {
                debug!(worker = %unit, task_id = %processed.task_id(), outcome = ?processed, "task settled");
            }
            Ok(None) => thread::sleep(poll),
            Err(e) if e.is_unavailable() => {
                warn!(worker = %unit, error = %e, "backing store unavailable; backing off");
                thread::sleep(poll);
            }
            Err(e) => {
                error!(worker = %unit, error = %e, "worker iteration failed");
                thread::sleep(poll);
            }
        }
    }

    info!(worker = %unit, "worker unit stopped");
}

fn scheduler_loop(executor: Executor, unit: String, poll: Duration, shutdown: Arc<AtomicBool>) {
    info!(worker = %unit, "retry scheduler started");

    while !shutdown.load(Ordering::Acquire) {
        match executor.promote_due() {
            Ok(0) => {}
            Ok(n) => debug!(worker = %unit, promoted = n, "promoted due tasks"),
            Err(e) => error!(worker = %unit, error = %e, "failed to promote due tasks"),
        }
        thread::sleep(poll);
    }

    info!(worker = %unit, "retry scheduler stopped");
}

/// Handle to a running pool. Dropping it stops the pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    busy: Arc<AtomicUsize>,
    units: usize,
    started: Instant,
    name: String,
}

impl WorkerPoolHandle {
    /// Stop every unit after its in-flight task and wait for them.
    pub fn shutdown(&mut self) {
        if self.joins.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                error!(pool = %self.name, "worker unit panicked");
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.joins.is_empty()
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            units: self.units,
            busy_units: self.busy.load(Ordering::Acquire),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Drop for WorkerPoolHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
