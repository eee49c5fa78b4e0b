//! Task record storage.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use taskflow_core::TaskId;

use crate::types::TaskRecord;

/// Task store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    /// The backend could not be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of [`TaskStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// The closure accepted the change and it was persisted.
    Applied(TaskRecord),
    /// The closure declined; the stored record is unchanged.
    Rejected(TaskRecord),
    Missing,
}

/// Task record persistence.
pub trait TaskStore: Send + Sync {
    /// Persist a new record.
    fn insert(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Get a record by ID.
    fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Atomic read-modify-write.
    ///
    /// `apply` mutates a copy of the stored record and returns whether the
    /// change should be persisted. No other writer can interleave between the
    /// read and the write. `apply` may run more than once if the backend
    /// retries on contention.
    fn update(
        &self,
        id: TaskId,
        apply: &mut dyn FnMut(&mut TaskRecord) -> bool,
    ) -> Result<Update, StoreError>;

    /// Records submitted by `owner`, oldest first.
    fn list_by_owner(&self, owner: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /// Delete terminal records whose `completed_at` is before `cutoff`.
    fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// In-memory task store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

fn poisoned() -> StoreError {
    StoreError::Storage("task store lock poisoned".to_string())
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TaskId, TaskRecord>>, StoreError> {
        self.tasks.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TaskId, TaskRecord>>, StoreError> {
        self.tasks.write().map_err(|_| poisoned())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut tasks = self.write()?;
        if tasks.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        tasks.insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn update(
        &self,
        id: TaskId,
        apply: &mut dyn FnMut(&mut TaskRecord) -> bool,
    ) -> Result<Update, StoreError> {
        let mut tasks = self.write()?;
        let Some(stored) = tasks.get_mut(&id) else {
            return Ok(Update::Missing);
        };

        let mut candidate = stored.clone();
        if apply(&mut candidate) {
            *stored = candidate.clone();
            Ok(Update::Applied(candidate))
        } else {
            Ok(Update::Rejected(stored.clone()))
        }
    }

    fn list_by_owner(&self, owner: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.read()?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| t.owner.as_deref() == Some(owner))
            .cloned()
            .collect();
        result.sort_by_key(|t| (t.created_at, t.id));
        Ok(result)
    }

    fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tasks = self.write()?;
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - tasks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskStatus};
    use taskflow_core::Payload;

    fn record(owner: Option<&str>) -> TaskRecord {
        TaskRecord::new(
            "test",
            Payload::new(),
            owner.map(str::to_string),
            TaskPriority::Normal,
            Utc::now(),
        )
    }

    #[test]
    fn insert_and_get() {
        let store = InMemoryTaskStore::new();
        let task = record(None);
        store.insert(&task).unwrap();

        assert_eq!(store.get(task.id).unwrap(), Some(task.clone()));
        assert_eq!(store.insert(&task), Err(StoreError::AlreadyExists(task.id)));
        assert_eq!(store.get(TaskId::new()).unwrap(), None);
    }

    #[test]
    fn update_applies_or_rejects() {
        let store = InMemoryTaskStore::new();
        let task = record(None);
        store.insert(&task).unwrap();

        let claimed = store
            .update(task.id, &mut |t| t.claim(Utc::now()).is_ok())
            .unwrap();
        assert!(matches!(claimed, Update::Applied(ref t) if t.status == TaskStatus::Processing));

        let rejected = store
            .update(task.id, &mut |t| t.cancel(Utc::now()).is_ok())
            .unwrap();
        assert!(matches!(rejected, Update::Rejected(ref t) if t.status == TaskStatus::Processing));
        assert_eq!(store.get(task.id).unwrap().unwrap().status, TaskStatus::Processing);

        assert_eq!(store.update(TaskId::new(), &mut |_| true).unwrap(), Update::Missing);
    }

    #[test]
    fn lists_by_owner_in_submission_order() {
        let store = InMemoryTaskStore::new();
        let first = record(Some("alice"));
        let other = record(Some("bob"));
        let mut second = record(Some("alice"));
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        store.insert(&second).unwrap();
        store.insert(&other).unwrap();
        store.insert(&first).unwrap();

        let ids: Vec<_> = store.list_by_owner("alice").unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(store.list_by_owner("carol").unwrap().is_empty());
    }

    #[test]
    fn purge_removes_only_old_terminal_records() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(8);

        let mut finished = record(None);
        finished.cancel(old).unwrap();
        let mut recent = record(None);
        recent.cancel(now).unwrap();
        let pending = record(None);

        for t in [&finished, &recent, &pending] {
            store.insert(t).unwrap();
        }

        let removed = store.purge_finished(now - chrono::Duration::days(7)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(finished.id).unwrap().is_none());
        assert!(store.get(recent.id).unwrap().is_some());
        assert_eq!(store.get(pending.id).unwrap().unwrap().status, TaskStatus::Pending);
    }
}
