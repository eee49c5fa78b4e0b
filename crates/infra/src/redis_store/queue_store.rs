use chrono::{DateTime, Utc};
use redis::{Commands, Script};
use tracing::instrument;

use taskflow_core::TaskId;
use taskflow_queue::{PriorityQueueStore, QueueDepths, StoreError, TaskPriority};

use super::{RedisBackend, store_error};

/// KEYS: bucket, seq, delayed. ARGV: id, delayed member.
const PUSH: &str = r"
redis.call('ZREM', KEYS[3], ARGV[2])
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('ZADD', KEYS[1], redis.call('INCR', KEYS[2]), ARGV[1])
return 1
";

/// KEYS: buckets, highest priority first. Returns `{bucket index, id}`.
const POP: &str = r"
for i, key in ipairs(KEYS) do
  local popped = redis.call('ZPOPMIN', key)
  if popped[1] then
    return {i - 1, popped[1]}
  end
end
return false
";

/// KEYS: delayed, seq, then the four buckets by index. ARGV: now (ms).
const PROMOTE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = {}
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  local sep = string.find(member, ':', 1, true)
  local bucket = tonumber(string.sub(member, 1, sep - 1))
  local id = string.sub(member, sep + 1)
  local key = KEYS[3 + bucket]
  if not redis.call('ZSCORE', key, id) then
    redis.call('ZADD', key, redis.call('INCR', KEYS[2]), id)
  end
  table.insert(moved, id)
end
return moved
";

/// Priority buckets as sorted sets scored by a global push sequence, so
/// `ZPOPMIN` yields the oldest id of a bucket.
#[derive(Clone)]
pub struct RedisPriorityQueue {
    backend: RedisBackend,
    push: Script,
    pop: Script,
    promote: Script,
}

impl core::fmt::Debug for RedisPriorityQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisPriorityQueue")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

fn parse_id(raw: &str) -> Result<TaskId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Serialization(format!("invalid task id {raw:?}: {e}")))
}

impl RedisPriorityQueue {
    pub(crate) fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            push: Script::new(PUSH),
            pop: Script::new(POP),
            promote: Script::new(PROMOTE),
        }
    }

    fn bucket_key(&self, priority: TaskPriority) -> String {
        self.backend.key(&format!("queue:{}", priority.as_str()))
    }

    /// Buckets in pop order.
    fn bucket_keys(&self) -> Vec<String> {
        TaskPriority::DESCENDING
            .iter()
            .map(|p| self.bucket_key(*p))
            .collect()
    }

    fn seq_key(&self) -> String {
        self.backend.key("queue:seq")
    }

    fn delayed_key(&self) -> String {
        self.backend.key("queue:delayed")
    }

    fn delayed_member(priority: TaskPriority, id: TaskId) -> String {
        format!("{}:{}", priority.bucket(), id)
    }
}

impl PriorityQueueStore for RedisPriorityQueue {
    #[instrument(skip(self), err)]
    fn push(&self, priority: TaskPriority, id: TaskId) -> Result<(), StoreError> {
        let mut conn = self.backend.connection()?;
        let _: i64 = self
            .push
            .key(self.bucket_key(priority))
            .key(self.seq_key())
            .key(self.delayed_key())
            .arg(id.to_string())
            .arg(Self::delayed_member(priority, id))
            .invoke(&mut conn)
            .map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn pop(&self) -> Result<Option<(TaskPriority, TaskId)>, StoreError> {
        let mut conn = self.backend.connection()?;
        let mut invocation = self.pop.prepare_invoke();
        for key in self.bucket_keys() {
            invocation.key(key);
        }
        let popped: Option<(usize, String)> = invocation.invoke(&mut conn).map_err(store_error)?;
        let Some((bucket, raw)) = popped else {
            return Ok(None);
        };
        let priority = TaskPriority::DESCENDING
            .get(bucket)
            .copied()
            .ok_or_else(|| StoreError::Serialization(format!("invalid bucket index {bucket}")))?;
        Ok(Some((priority, parse_id(&raw)?)))
    }

    #[instrument(skip(self), err)]
    fn remove(&self, priority: TaskPriority, id: TaskId) -> Result<bool, StoreError> {
        let mut conn = self.backend.connection()?;
        let (queued, delayed): (i64, i64) = redis::pipe()
            .atomic()
            .zrem(self.bucket_key(priority), id.to_string())
            .zrem(self.delayed_key(), Self::delayed_member(priority, id))
            .query(&mut conn)
            .map_err(store_error)?;
        Ok(queued + delayed > 0)
    }

    #[instrument(skip(self), err)]
    fn schedule(&self, priority: TaskPriority, id: TaskId, due: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.backend.connection()?;
        let _: () = conn
            .zadd(
                self.delayed_key(),
                Self::delayed_member(priority, id),
                due.timestamp_millis(),
            )
            .map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let mut conn = self.backend.connection()?;
        let mut invocation = self.promote.prepare_invoke();
        invocation.key(self.delayed_key()).key(self.seq_key());
        // Bucket index order, which matches TaskPriority::DESCENDING.
        for key in self.bucket_keys() {
            invocation.key(key);
        }
        let moved: Vec<String> = invocation
            .arg(now.timestamp_millis())
            .invoke(&mut conn)
            .map_err(store_error)?;
        moved.iter().map(|raw| parse_id(raw)).collect()
    }

    #[instrument(skip(self), err)]
    fn depths(&self) -> Result<QueueDepths, StoreError> {
        let mut conn = self.backend.connection()?;
        let mut pipe = redis::pipe();
        for key in self.bucket_keys() {
            pipe.zcard(key);
        }
        let counts: Vec<usize> = pipe.query(&mut conn).map_err(store_error)?;

        let mut depths = QueueDepths::default();
        for (priority, depth) in TaskPriority::DESCENDING.into_iter().zip(counts) {
            depths.set(priority, depth);
        }
        Ok(depths)
    }

    #[instrument(skip(self), err)]
    fn scheduled_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.backend.connection()?;
        conn.zcard(self.delayed_key()).map_err(store_error)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
