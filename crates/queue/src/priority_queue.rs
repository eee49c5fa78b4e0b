//! Priority buckets and the delayed-retry set.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use taskflow_core::TaskId;

use crate::store::StoreError;
use crate::types::TaskPriority;

/// Pending ids per priority bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn get(&self, priority: TaskPriority) -> usize {
        match priority {
            TaskPriority::Urgent => self.urgent,
            TaskPriority::High => self.high,
            TaskPriority::Normal => self.normal,
            TaskPriority::Low => self.low,
        }
    }

    pub fn set(&mut self, priority: TaskPriority, depth: usize) {
        match priority {
            TaskPriority::Urgent => self.urgent = depth,
            TaskPriority::High => self.high = depth,
            TaskPriority::Normal => self.normal = depth,
            TaskPriority::Low => self.low = depth,
        }
    }

    pub fn total(&self) -> usize {
        self.urgent + self.high + self.normal + self.low
    }
}

/// Priority queue storage.
///
/// Implementations serialize `push`/`pop` at the storage layer; callers never
/// add their own locking.
pub trait PriorityQueueStore: Send + Sync {
    /// Append `id` to its bucket. Pushing an id that is already queued is a no-op.
    fn push(&self, priority: TaskPriority, id: TaskId) -> Result<(), StoreError>;

    /// Remove and return the oldest id of the highest non-empty bucket,
    /// together with that bucket's priority.
    fn pop(&self) -> Result<Option<(TaskPriority, TaskId)>, StoreError>;

    /// Remove `id` from its bucket and from the delayed set.
    fn remove(&self, priority: TaskPriority, id: TaskId) -> Result<bool, StoreError>;

    /// Park `id` until `due`; it is pushed back by [`promote_due`](Self::promote_due).
    fn schedule(&self, priority: TaskPriority, id: TaskId, due: DateTime<Utc>) -> Result<(), StoreError>;

    /// Move every parked id whose due time is `<= now` into its bucket and
    /// return the moved ids in due order.
    fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError>;

    fn depths(&self) -> Result<QueueDepths, StoreError>;

    /// Number of parked ids.
    fn scheduled_len(&self) -> Result<usize, StoreError>;

    /// Short backend name for diagnostics ("memory", "redis").
    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct Buckets {
    queues: [VecDeque<TaskId>; 4],
    queued: HashSet<TaskId>,
    /// (due, sequence) -> parked entry
    delayed: BTreeMap<(DateTime<Utc>, u64), (TaskPriority, TaskId)>,
    delayed_index: HashMap<TaskId, (DateTime<Utc>, u64)>,
    sequence: u64,
}

impl Buckets {
    fn enqueue(&mut self, priority: TaskPriority, id: TaskId) {
        if self.queued.insert(id) {
            self.queues[priority.bucket()].push_back(id);
        }
    }

    fn unschedule(&mut self, id: TaskId) -> bool {
        match self.delayed_index.remove(&id) {
            Some(key) => self.delayed.remove(&key).is_some(),
            None => false,
        }
    }
}

/// Mutex-protected in-process queue. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryPriorityQueue {
    inner: Mutex<Buckets>,
}

impl InMemoryPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Buckets>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("priority queue lock poisoned".to_string()))
    }
}

impl PriorityQueueStore for InMemoryPriorityQueue {
    fn push(&self, priority: TaskPriority, id: TaskId) -> Result<(), StoreError> {
        let mut buckets = self.lock()?;
        buckets.unschedule(id);
        buckets.enqueue(priority, id);
        Ok(())
    }

    fn pop(&self) -> Result<Option<(TaskPriority, TaskId)>, StoreError> {
        let mut buckets = self.lock()?;
        let popped = TaskPriority::DESCENDING
            .into_iter()
            .find_map(|p| buckets.queues[p.bucket()].pop_front().map(|id| (p, id)));
        if let Some((_, id)) = popped {
            buckets.queued.remove(&id);
        }
        Ok(popped)
    }

    fn remove(&self, priority: TaskPriority, id: TaskId) -> Result<bool, StoreError> {
        let mut buckets = self.lock()?;
        let mut removed = buckets.unschedule(id);
        if buckets.queued.remove(&id) {
            buckets.queues[priority.bucket()].retain(|queued| *queued != id);
            removed = true;
        }
        Ok(removed)
    }

    fn schedule(&self, priority: TaskPriority, id: TaskId, due: DateTime<Utc>) -> Result<(), StoreError> {
        let mut buckets = self.lock()?;
        buckets.unschedule(id);
        buckets.sequence += 1;
        let key = (due, buckets.sequence);
        buckets.delayed.insert(key, (priority, id));
        buckets.delayed_index.insert(id, key);
        Ok(())
    }

    fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let mut guard = self.lock()?;
        let buckets = &mut *guard;
        let mut moved = Vec::new();

        while let Some(entry) = buckets.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (priority, id) = entry.remove();
            buckets.delayed_index.remove(&id);
            buckets.enqueue(priority, id);
            moved.push(id);
        }

        Ok(moved)
    }

    fn depths(&self) -> Result<QueueDepths, StoreError> {
        let buckets = self.lock()?;
        let mut depths = QueueDepths::default();
        for priority in TaskPriority::DESCENDING {
            depths.set(priority, buckets.queues[priority.bucket()].len());
        }
        Ok(depths)
    }

    fn scheduled_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.delayed.len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
