//! Redis-backed stores.
//!
//! Every store opens a connection per call from a shared [`redis::Client`], so
//! a backend survives Redis restarts without reconnect logic. Operations that
//! must be atomic run as Lua scripts or WATCH/MULTI transactions.
//!
//! ## Key layout (`<p>` is the configured prefix)
//!
//! - `<p>:task:<id>`: task record as JSON
//! - `<p>:owner:<owner>`: ZSET of task ids scored by creation time
//! - `<p>:finished`: ZSET of terminal task ids scored by completion time
//! - `<p>:queue:<priority>`: ZSET bucket scored by push sequence
//! - `<p>:queue:seq`: push sequence counter
//! - `<p>:queue:delayed`: ZSET of `<bucket>:<id>` scored by due time
//! - `<p>:stats`: HASH of processing counters
//! - `<p>:rate_limit:...`: fixed-window counters with native expiry

mod counter_store;
mod queue_store;
mod stats_store;
mod task_store;

use std::sync::Arc;

use redis::RedisError;
use tracing::instrument;

use taskflow_queue::{QueueBackends, StoreError};
use taskflow_ratelimit::RateLimitError;

pub use counter_store::RedisCounterStore;
pub use queue_store::RedisPriorityQueue;
pub use stats_store::RedisStatsStore;
pub use task_store::RedisTaskStore;

/// Connection target plus key namespace shared by the Redis stores.
#[derive(Debug, Clone)]
pub struct RedisBackend {
    client: Arc<redis::Client>,
    prefix: String,
}

impl RedisBackend {
    /// Validate `redis_url`. No connection is made until the first call.
    pub fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.trim_end_matches(':').to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    pub(crate) fn connection(&self) -> Result<redis::Connection, StoreError> {
        self.client.get_connection().map_err(store_error)
    }

    /// Round-trip to the server.
    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    pub fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query(&mut conn).map_err(store_error)?;
        Ok(())
    }

    pub fn task_store(&self) -> RedisTaskStore {
        RedisTaskStore::new(self.clone())
    }

    pub fn priority_queue(&self) -> RedisPriorityQueue {
        RedisPriorityQueue::new(self.clone())
    }

    pub fn stats_store(&self) -> RedisStatsStore {
        RedisStatsStore::new(self.clone())
    }

    pub fn counter_store(&self) -> RedisCounterStore {
        RedisCounterStore::new(self.clone())
    }

    pub fn queue_backends(&self) -> QueueBackends {
        QueueBackends {
            tasks: Arc::new(self.task_store()),
            queue: Arc::new(self.priority_queue()),
            stats: Arc::new(self.stats_store()),
        }
    }
}

fn is_unreachable(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
}

pub(crate) fn store_error(e: RedisError) -> StoreError {
    if is_unreachable(&e) {
        StoreError::Unavailable(e.to_string())
    } else if e.kind() == redis::ErrorKind::TypeError {
        StoreError::Serialization(e.to_string())
    } else {
        StoreError::Storage(e.to_string())
    }
}

pub(crate) fn rate_limit_error(e: RedisError) -> RateLimitError {
    if is_unreachable(&e) {
        RateLimitError::Unavailable(e.to_string())
    } else {
        RateLimitError::Storage(e.to_string())
    }
}

/// Carry a decode failure through a redis transaction closure.
pub(crate) fn decode_error(e: impl ToString) -> RedisError {
    RedisError::from((redis::ErrorKind::TypeError, "invalid task record", e.to_string()))
}

pub(crate) fn counter_error(e: StoreError) -> RateLimitError {
    match e {
        StoreError::Unavailable(msg) => RateLimitError::Unavailable(msg),
        other => RateLimitError::Storage(other.to_string()),
    }
}
