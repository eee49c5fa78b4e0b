use chrono::{DateTime, Utc};
use redis::{Commands, Script};
use tracing::instrument;

use taskflow_ratelimit::{Acquire, CounterStore, RateLimitError};

use super::{RedisBackend, counter_error, rate_limit_error};

/// KEYS: counter. ARGV: limit, expiry (unix ms).
///
/// Compare and increment in one step so concurrent callers in different
/// processes cannot both take the last slot.
const ACQUIRE: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count >= tonumber(ARGV[1]) then
  return {0, count}
end
count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIREAT', KEYS[1], ARGV[2])
end
return {1, count}
";

/// Fixed-window counters that expire natively at the end of their window.
///
/// Keys arrive fully namespaced from the limiter.
#[derive(Clone)]
pub struct RedisCounterStore {
    backend: RedisBackend,
    acquire: Script,
}

impl core::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    pub(crate) fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            acquire: Script::new(ACQUIRE),
        }
    }

    fn connection(&self) -> Result<redis::Connection, RateLimitError> {
        self.backend.connection().map_err(counter_error)
    }
}

impl CounterStore for RedisCounterStore {
    #[instrument(skip(self, _now), err)]
    fn try_acquire(
        &self,
        key: &str,
        limit: u64,
        _now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Acquire, RateLimitError> {
        let mut conn = self.connection()?;
        let (allowed, count): (i64, u64) = self
            .acquire
            .key(key)
            .arg(limit)
            .arg(expires_at.timestamp_millis())
            .invoke(&mut conn)
            .map_err(rate_limit_error)?;

        Ok(Acquire {
            allowed: allowed == 1,
            count,
        })
    }

    #[instrument(skip(self, _now), err)]
    fn get(&self, key: &str, _now: DateTime<Utc>) -> Result<u64, RateLimitError> {
        let mut conn = self.connection()?;
        let count: Option<u64> = conn.get(key).map_err(rate_limit_error)?;
        Ok(count.unwrap_or_default())
    }

    #[instrument(skip(self), err)]
    fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.connection()?;
        let _: () = conn.del(key).map_err(rate_limit_error)?;
        Ok(())
    }
}
