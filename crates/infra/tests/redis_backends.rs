//! Runs against a live Redis when `TASKFLOW_TEST_REDIS_URL` is set;
//! otherwise every test returns early.

#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskflow_core::{ManualClock, Payload, TaskId};
use taskflow_infra::redis_store::RedisBackend;
use taskflow_queue::{
    BackoffPolicy, HandlerOutcome, PriorityQueueStore, QueueConfig, QueueManager, StatEvent,
    StatsStore, StoreError, TaskPriority, TaskRecord, TaskStatus, TaskStore, Update,
};
use taskflow_ratelimit::{Quota, RateLimiter};

fn backend() -> Option<RedisBackend> {
    let url = std::env::var("TASKFLOW_TEST_REDIS_URL").ok()?;
    // Fresh namespace per test so runs never see each other's keys.
    let prefix = format!("taskflow-test:{}", TaskId::new());
    Some(RedisBackend::connect(&url, &prefix).expect("valid redis url"))
}

fn record(owner: Option<&str>, priority: TaskPriority) -> TaskRecord {
    TaskRecord::new("test", Payload::new(), owner.map(str::to_string), priority, Utc::now())
}

#[test]
fn unreachable_server_is_reported_as_unavailable() {
    let backend = RedisBackend::connect("redis://127.0.0.1:1/0", "taskflow-test").unwrap();
    assert!(matches!(backend.ping(), Err(StoreError::Unavailable(_))));
    assert!(matches!(
        backend.priority_queue().pop(),
        Err(StoreError::Unavailable(_))
    ));
}

#[test]
fn task_store_round_trip_and_update() {
    let Some(backend) = backend() else { return };
    let store = backend.task_store();
    let task = record(Some("alice"), TaskPriority::Normal);

    store.insert(&task).unwrap();
    assert_eq!(store.insert(&task), Err(StoreError::AlreadyExists(task.id)));
    assert_eq!(store.get(task.id).unwrap(), Some(task.clone()));

    let now = Utc::now();
    let claimed = store.update(task.id, &mut |t| t.claim(now).is_ok()).unwrap();
    assert!(matches!(claimed, Update::Applied(ref r) if r.status == TaskStatus::Processing));

    let rejected = store.update(task.id, &mut |t| t.cancel(now).is_ok()).unwrap();
    assert!(matches!(rejected, Update::Rejected(ref r) if r.status == TaskStatus::Processing));

    assert_eq!(store.update(TaskId::new(), &mut |_| true).unwrap(), Update::Missing);
    assert_eq!(store.list_by_owner("alice").unwrap().len(), 1);
    assert!(store.list_by_owner("nobody").unwrap().is_empty());
}

#[test]
fn task_store_purges_old_terminal_records() {
    let Some(backend) = backend() else { return };
    let store = backend.task_store();
    let done = record(Some("bob"), TaskPriority::Low);
    let pending = record(Some("bob"), TaskPriority::Low);
    store.insert(&done).unwrap();
    store.insert(&pending).unwrap();

    let now = Utc::now();
    store.update(done.id, &mut |t| t.cancel(now).is_ok()).unwrap();

    let later = now + chrono::Duration::seconds(1);
    assert_eq!(store.purge_finished(later).unwrap(), 1);
    assert_eq!(store.get(done.id).unwrap(), None);
    assert!(store.get(pending.id).unwrap().is_some());
    assert_eq!(store.list_by_owner("bob").unwrap().len(), 1);
}

#[test]
fn queue_pops_by_priority_then_fifo() {
    let Some(backend) = backend() else { return };
    let queue = backend.priority_queue();

    let low = TaskId::new();
    let normal_a = TaskId::new();
    let normal_b = TaskId::new();
    let urgent = TaskId::new();
    queue.push(TaskPriority::Low, low).unwrap();
    queue.push(TaskPriority::Normal, normal_a).unwrap();
    queue.push(TaskPriority::Normal, normal_b).unwrap();
    queue.push(TaskPriority::Normal, normal_a).unwrap();
    queue.push(TaskPriority::Urgent, urgent).unwrap();

    let depths = queue.depths().unwrap();
    assert_eq!(depths.normal, 2);
    assert_eq!(depths.total(), 4);

    let popped: Vec<(TaskPriority, TaskId)> = std::iter::from_fn(|| queue.pop().unwrap()).collect();
    assert_eq!(
        popped,
        vec![
            (TaskPriority::Urgent, urgent),
            (TaskPriority::Normal, normal_a),
            (TaskPriority::Normal, normal_b),
            (TaskPriority::Low, low),
        ]
    );
}

#[test]
fn queue_parks_and_promotes_scheduled_ids() {
    let Some(backend) = backend() else { return };
    let queue = backend.priority_queue();
    let now = Utc::now();
    let id = TaskId::new();
    let cancelled = TaskId::new();

    queue.schedule(TaskPriority::High, id, now).unwrap();
    queue.schedule(TaskPriority::High, cancelled, now).unwrap();
    assert!(queue.remove(TaskPriority::High, cancelled).unwrap());
    assert_eq!(queue.scheduled_len().unwrap(), 1);
    assert_eq!(queue.pop().unwrap(), None);

    assert!(queue.promote_due(now - chrono::Duration::seconds(1)).unwrap().is_empty());
    assert_eq!(queue.promote_due(now).unwrap(), vec![id]);
    assert_eq!(queue.depths().unwrap().high, 1);
    assert_eq!(queue.pop().unwrap(), Some((TaskPriority::High, id)));
}

#[test]
fn concurrent_pops_never_duplicate() {
    let Some(backend) = backend() else { return };
    let queue = Arc::new(backend.priority_queue());
    let ids: Vec<TaskId> = (0..200).map(|_| TaskId::new()).collect();
    for (i, id) in ids.iter().enumerate() {
        queue.push(TaskPriority::DESCENDING[i % 4], *id).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::iter::from_fn(|| queue.pop().unwrap())
                    .map(|(_, id)| id)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut popped: Vec<TaskId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    popped.sort();
    popped.dedup();
    assert_eq!(popped.len(), ids.len());
}

#[test]
fn stats_accumulate_across_handles() {
    let Some(backend) = backend() else { return };
    let first = backend.stats_store();
    let second = backend.stats_store();

    first.record(StatEvent::Completed { elapsed: Duration::from_millis(40) }).unwrap();
    second.record(StatEvent::Failed { elapsed: None }).unwrap();

    let counters = first.counters().unwrap();
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.failed, 1);
    assert_eq!(counters.processed(), 2);
    assert_eq!(counters.average_processing_ms(), 40.0);
}

#[test]
fn shared_counters_enforce_window_limits() {
    let Some(backend) = backend() else { return };
    // Counters expire in real time, so pin the clock to the start of the
    // next hourly window.
    let hour_ms = 3_600_000;
    let clock = ManualClock::at_millis((Utc::now().timestamp_millis() / hour_ms + 1) * hour_ms);
    let limiter = RateLimiter::new(Arc::new(backend.counter_store()), Arc::new(clock))
        .with_prefix(format!("{}:rate_limit", backend.prefix()));
    let quota = Quota::per_hour(5);

    let remaining: Vec<u64> = (0..5)
        .map(|_| limiter.check("user:carol", &quota).unwrap())
        .inspect(|d| assert!(d.allowed))
        .map(|d| d.remaining)
        .collect();
    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

    let denied = limiter.check("user:carol", &quota).unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after > Duration::ZERO);
    assert!(denied.retry_after <= Duration::from_secs(3600));

    assert_eq!(limiter.info("user:carol", &quota).unwrap().remaining, 0);
    limiter.reset("user:carol", &quota).unwrap();
    assert!(limiter.check("user:carol", &quota).unwrap().allowed);
}

#[test]
fn queue_manager_runs_on_redis() {
    let Some(backend) = backend() else { return };
    let clock = ManualClock::new(Utc::now());
    let config = QueueConfig {
        backoff: BackoffPolicy::immediate(),
        ..QueueConfig::default()
    };
    let queue = QueueManager::new(backend.queue_backends(), config, Arc::new(clock));
    queue.register_handler("echo", |task: &TaskRecord| HandlerOutcome::success(task.payload.clone()));
    queue.register_handler("broken", |_: &TaskRecord| HandlerOutcome::failure("down"));

    let mut payload = Payload::new();
    payload.insert("n".into(), 7.into());
    let ok = queue
        .submit("echo", payload.clone(), Some("dana"), TaskPriority::High)
        .unwrap();
    let bad = queue.submit("broken", Payload::new(), None, TaskPriority::Low).unwrap();
    let missing = queue.submit("nope", Payload::new(), None, TaskPriority::Urgent).unwrap();

    queue.executor(None).drain().unwrap();

    let ok = queue.get_status(ok).unwrap();
    assert_eq!(ok.status, TaskStatus::Completed);
    assert_eq!(ok.result, Some(payload));

    let bad = queue.get_status(bad).unwrap();
    assert_eq!(bad.status, TaskStatus::Failed);
    assert_eq!(bad.retry_count, 3);

    let missing = queue.get_status(missing).unwrap();
    assert_eq!(missing.status, TaskStatus::Failed);
    assert_eq!(missing.retry_count, 0);

    let stats = queue.get_stats().unwrap();
    assert_eq!(stats.backend, "redis");
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_failed, 2);
    assert_eq!(stats.total_retried, 3);
}
