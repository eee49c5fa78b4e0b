use chrono::{DateTime, Utc};
use redis::Commands;
use tracing::instrument;

use taskflow_core::TaskId;
use taskflow_queue::{StoreError, TaskRecord, TaskStore, Update};

use super::{RedisBackend, decode_error, store_error};

/// Task records as JSON strings, with owner and completion indexes.
#[derive(Debug, Clone)]
pub struct RedisTaskStore {
    backend: RedisBackend,
}

fn encode(record: &TaskRecord) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(raw: &str) -> Result<TaskRecord, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl RedisTaskStore {
    pub(crate) fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn task_key(&self, id: impl std::fmt::Display) -> String {
        self.backend.key(&format!("task:{id}"))
    }

    fn owner_key(&self, owner: &str) -> String {
        self.backend.key(&format!("owner:{owner}"))
    }

    fn finished_key(&self) -> String {
        self.backend.key("finished")
    }

    fn load_many(
        &self,
        conn: &mut redis::Connection,
        ids: &[String],
    ) -> Result<Vec<Option<String>>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.task_key(id)).collect();
        redis::cmd("MGET").arg(&keys).query(conn).map_err(store_error)
    }
}

impl TaskStore for RedisTaskStore {
    #[instrument(skip(self, record), fields(task_id = %record.id), err)]
    fn insert(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let json = encode(record)?;
        let mut conn = self.backend.connection()?;

        let created: Option<String> = redis::cmd("SET")
            .arg(self.task_key(record.id))
            .arg(&json)
            .arg("NX")
            .query(&mut conn)
            .map_err(store_error)?;
        if created.is_none() {
            return Err(StoreError::AlreadyExists(record.id));
        }

        if let Some(owner) = &record.owner {
            let _: () = conn
                .zadd(
                    self.owner_key(owner),
                    record.id.to_string(),
                    record.created_at.timestamp_millis(),
                )
                .map_err(store_error)?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.backend.connection()?;
        let raw: Option<String> = conn.get(self.task_key(id)).map_err(store_error)?;
        raw.as_deref().map(decode).transpose()
    }

    #[instrument(skip(self, apply), err)]
    fn update(
        &self,
        id: TaskId,
        apply: &mut dyn FnMut(&mut TaskRecord) -> bool,
    ) -> Result<Update, StoreError> {
        let key = self.task_key(id);
        let finished = self.finished_key();
        let mut conn = self.backend.connection()?;

        redis::transaction(&mut conn, &[&key], |con, pipe| {
            let raw: Option<String> = con.get(&key)?;
            let Some(raw) = raw else {
                return Ok(Some(Update::Missing));
            };
            let stored: TaskRecord = serde_json::from_str(&raw).map_err(decode_error)?;

            let mut candidate = stored.clone();
            if !apply(&mut candidate) {
                return Ok(Some(Update::Rejected(stored)));
            }

            let json = serde_json::to_string(&candidate).map_err(decode_error)?;
            pipe.set(&key, json).ignore();
            if let (true, Some(at)) = (candidate.status.is_terminal(), candidate.completed_at) {
                pipe.zadd(&finished, id.to_string(), at.timestamp_millis()).ignore();
            }

            // `None` means a concurrent writer touched the key; retry.
            let committed: Option<()> = pipe.query(con)?;
            Ok(committed.map(|()| Update::Applied(candidate)))
        })
        .map_err(store_error)
    }

    #[instrument(skip(self), err)]
    fn list_by_owner(&self, owner: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let mut conn = self.backend.connection()?;
        let ids: Vec<String> = conn.zrange(self.owner_key(owner), 0, -1).map_err(store_error)?;

        let mut records = self
            .load_many(&mut conn, &ids)?
            .into_iter()
            .flatten()
            .map(|raw| decode(&raw))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|t| (t.created_at, t.id));
        Ok(records)
    }

    #[instrument(skip(self), err)]
    fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let finished = self.finished_key();
        let mut conn = self.backend.connection()?;

        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&finished)
            .arg("-inf")
            .arg(format!("({}", cutoff.timestamp_millis()))
            .query(&mut conn)
            .map_err(store_error)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let raws = self.load_many(&mut conn, &ids)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut removed = 0;
        for (id, raw) in ids.iter().zip(raws) {
            pipe.zrem(&finished, id).ignore();
            let Some(raw) = raw else { continue };
            let record = decode(&raw)?;
            pipe.del(self.task_key(id)).ignore();
            if let Some(owner) = &record.owner {
                pipe.zrem(self.owner_key(owner), id).ignore();
            }
            removed += 1;
        }
        let _: () = pipe.query(&mut conn).map_err(store_error)?;

        Ok(removed)
    }
}
